//! Lease document models and coordinator results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use svpn_core::document::StoreError;
use svpn_core::time::Timestamp;

/// The `lock` sub-document of a code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub platform: String,
    pub acquired_at: Timestamp,
    pub renewed_at: Timestamp,
    /// Bumped whenever the holder changes.
    pub generation: u64,
}

impl LeaseRecord {
    /// Whether the last renewal is older than `ttl` at `now`.
    pub fn is_stale(&self, now: Timestamp, ttl: Duration) -> bool {
        now.saturating_since(self.renewed_at) > ttl
    }

    pub fn age(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.renewed_at)
    }

    /// A released lease: no holder, generation kept for the next claim.
    pub fn cleared(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.holder_id.is_empty()
    }
}

const fn default_active() -> bool {
    true
}

/// A redemption code document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRecord {
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_path: Option<String>,
    /// Older documents name the connection under `vlessPath`.
    #[serde(default, rename = "vlessPath", skip_serializing_if = "Option::is_none")]
    pub legacy_connection_path: Option<String>,
    #[serde(default)]
    pub lock: Option<LeaseRecord>,
}

impl CodeRecord {
    /// Connection document for this code; `connectionPath` wins over `vlessPath`.
    pub fn connection(&self) -> Option<&str> {
        self.connection_path
            .as_deref()
            .or(self.legacy_connection_path.as_deref())
    }

    /// The lease, unless absent, null, or cleared.
    pub fn live_lock(&self) -> Option<&LeaseRecord> {
        self.lock.as_ref().filter(|l| !l.holder_id.is_empty())
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// How a lease was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// No previous lease existed.
    Fresh,
    /// The caller already held the lease.
    Resumed,
    /// Another holder's lease had gone stale.
    TakenOver,
    /// Lock-free default mode; nothing was written.
    Unlocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub kind: GrantKind,
    /// The lease as written; `None` in lock-free mode.
    pub lease: Option<LeaseRecord>,
    /// Connection document named by the code, if any.
    pub connection_path: Option<String>,
}

/// The live lease that blocked an acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub holder_id: String,
    pub platform: String,
    pub renewed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted(Grant),
    Denied(Denial),
}

impl Decision {
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Result of a single renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// `renewedAt` was advanced (or a stale lease reclaimed).
    Renewed(LeaseRecord),
    /// Nothing to renew: lock-free mode, missing code, or no lock.
    NoLease,
    /// Another holder owns a live lease.
    Lost { holder_id: String },
    /// The code was deactivated or expired.
    Revoked,
}

impl RenewOutcome {
    /// Whether the session may keep running.
    pub const fn keeps_session(&self) -> bool {
        matches!(self, Self::Renewed(_) | Self::NoLease)
    }
}

/// Read-only view of a code's lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub code: String,
    pub active: bool,
    pub expires_at: Option<Timestamp>,
    pub lease: Option<LeaseRecord>,
    pub age: Option<Duration>,
    pub stale: bool,
}

/// Lease coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Code {0} not found")]
    NotFound(String),

    #[error("Code {0} is not active")]
    Inactive(String),

    #[error("Code {0} has expired")]
    Expired(String),

    #[error("Code {code} is malformed: {reason}")]
    Corrupt { code: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn code_record_defaults() {
        let record: CodeRecord = serde_json::from_value(json!({"unrelated": 1})).unwrap();
        assert!(record.active);
        assert!(record.expires_at.is_none());
        assert!(record.live_lock().is_none());
    }

    #[test]
    fn legacy_path_alias_and_cleared_lock() {
        let record: CodeRecord = serde_json::from_value(json!({
            "vlessPath": "configs/eu",
            "lock": {"holderId": "", "platform": ""}
        }))
        .unwrap();
        assert_eq!(record.connection(), Some("configs/eu"));
        assert!(record.lock.is_some());
        assert!(record.live_lock().is_none());

        let record: CodeRecord = serde_json::from_value(json!({"lock": null})).unwrap();
        assert!(record.live_lock().is_none());
    }

    #[test]
    fn connection_path_wins_over_legacy_name() {
        let record: CodeRecord = serde_json::from_value(json!({
            "vlessPath": "configs/eu",
            "connectionPath": "configs/us"
        }))
        .unwrap();
        assert_eq!(record.connection(), Some("configs/us"));
    }

    #[test]
    fn lease_serializes_camel_case() {
        let lease = LeaseRecord {
            holder_id: "d-1".into(),
            platform: "linux".into(),
            acquired_at: Timestamp::from_millis(1),
            renewed_at: Timestamp::from_millis(2),
            generation: 3,
        };
        assert_eq!(
            serde_json::to_value(&lease).unwrap(),
            json!({"holderId": "d-1", "platform": "linux", "acquiredAt": 1, "renewedAt": 2, "generation": 3})
        );
    }

    #[test]
    fn staleness_is_strictly_greater_than_ttl() {
        let lease = LeaseRecord {
            renewed_at: Timestamp::from_millis(0),
            ..LeaseRecord::default()
        };
        let ttl = Duration::from_secs(120);
        assert!(!lease.is_stale(Timestamp::from_millis(120_000), ttl));
        assert!(lease.is_stale(Timestamp::from_millis(120_001), ttl));
    }

    #[test]
    fn expiry_is_inclusive() {
        let record = CodeRecord {
            active: true,
            expires_at: Some(Timestamp::from_millis(10)),
            connection_path: None,
            legacy_connection_path: None,
            lock: None,
        };
        assert!(!record.is_expired(Timestamp::from_millis(9)));
        assert!(record.is_expired(Timestamp::from_millis(10)));
    }
}
