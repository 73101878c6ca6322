//! Redemption-code leases.

mod coordinator;
mod types;

pub use coordinator::{BoundLease, DEFAULT_LEASE_TTL, LeaseCoordinator};
pub use types::{
    CodeRecord, Decision, Denial, Grant, GrantKind, LeaseError, LeaseRecord, LeaseStatus,
    RenewOutcome,
};
