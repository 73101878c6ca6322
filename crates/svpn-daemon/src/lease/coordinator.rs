//! Redemption-code lease coordinator.
//!
//! Enforces at most one live holder per code using only single-document
//! transactions. A lease is live while `now - renewedAt <= ttl`; the same
//! holder may always resume it, anyone may take over a stale one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use svpn_core::document::{DocPath, Document, DocumentStore, TxWrite};
use svpn_core::time::Timestamp;

use super::types::{
    CodeRecord, Decision, Denial, Grant, GrantKind, LeaseError, LeaseRecord, LeaseStatus,
    RenewOutcome,
};
use crate::heartbeat::LeaseRenewer;
use crate::storage::Catalog;

/// Default lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

const LOCK_FIELD: &str = "lock";

/// Result of evaluating a claim against the current lease.
enum Claim {
    Write(GrantKind, LeaseRecord),
    Blocked(Denial),
}

fn claim(
    current: Option<&LeaseRecord>,
    holder_id: &str,
    platform: &str,
    now: Timestamp,
    ttl: Duration,
) -> Claim {
    let (kind, acquired_at, generation) = match current {
        None => (GrantKind::Fresh, now, 1),
        Some(lease) if lease.is_cleared() => {
            (GrantKind::Fresh, now, lease.generation.saturating_add(1))
        }
        Some(lease) if lease.holder_id == holder_id => {
            (GrantKind::Resumed, lease.acquired_at, lease.generation)
        }
        Some(lease) if lease.is_stale(now, ttl) => {
            (GrantKind::TakenOver, now, lease.generation.saturating_add(1))
        }
        Some(lease) => {
            return Claim::Blocked(Denial {
                holder_id: lease.holder_id.clone(),
                platform: lease.platform.clone(),
                renewed_at: lease.renewed_at,
            });
        }
    };
    Claim::Write(
        kind,
        LeaseRecord {
            holder_id: holder_id.to_string(),
            platform: platform.to_string(),
            acquired_at,
            renewed_at: now,
            generation,
        },
    )
}

fn decode(code: &str, doc: &Document) -> Result<CodeRecord, LeaseError> {
    serde_json::from_value(Value::Object(doc.clone())).map_err(|e| LeaseError::Corrupt {
        code: code.to_string(),
        reason: e.to_string(),
    })
}

fn with_lock(code: &str, doc: &Document, lease: &LeaseRecord) -> Result<Document, LeaseError> {
    let value = serde_json::to_value(lease).map_err(|e| LeaseError::Corrupt {
        code: code.to_string(),
        reason: e.to_string(),
    })?;
    let mut updated = doc.clone();
    updated.insert(LOCK_FIELD.to_string(), value);
    Ok(updated)
}

/// Normalize a possibly empty code; `None` selects lock-free mode.
fn normalize(code: &str) -> Option<&str> {
    Some(code.trim()).filter(|c| !c.is_empty())
}

/// Lease coordinator over a document store.
pub struct LeaseCoordinator<S> {
    store: Arc<S>,
    catalog: Catalog,
    ttl: Duration,
}

impl<S: DocumentStore> LeaseCoordinator<S> {
    pub const fn new(store: Arc<S>, catalog: Catalog, ttl: Duration) -> Self {
        Self {
            store,
            catalog,
            ttl,
        }
    }

    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store-assigned current time.
    pub async fn now(&self) -> Result<Timestamp, LeaseError> {
        Ok(self.store.server_time().await?)
    }

    fn code_path(&self, code: &str) -> Result<DocPath, LeaseError> {
        Ok(self.catalog.code_path(code)?)
    }

    /// Acquire a lease on `code`, or resume one this holder already owns.
    ///
    /// An empty code selects lock-free mode and is granted without touching
    /// the store.
    pub async fn acquire_or_resume(
        &self,
        code: &str,
        holder_id: &str,
        platform: &str,
        now: Timestamp,
    ) -> Result<Decision, LeaseError> {
        let Some(code) = normalize(code) else {
            debug!("No code given; using lock-free default connection");
            return Ok(Decision::Granted(Grant {
                kind: GrantKind::Unlocked,
                lease: None,
                connection_path: None,
            }));
        };
        let path = self.code_path(code)?;
        let ttl = self.ttl;

        let decision = self
            .store
            .transact(&path, |doc| {
                let Some(doc) = doc else {
                    return TxWrite::Abort(Err(LeaseError::NotFound(code.to_string())));
                };
                let record = match decode(code, doc) {
                    Ok(record) => record,
                    Err(e) => return TxWrite::Abort(Err(e)),
                };
                if !record.active {
                    return TxWrite::Abort(Err(LeaseError::Inactive(code.to_string())));
                }
                if record.is_expired(now) {
                    return TxWrite::Abort(Err(LeaseError::Expired(code.to_string())));
                }

                match claim(record.lock.as_ref(), holder_id, platform, now, ttl) {
                    Claim::Blocked(denial) => TxWrite::Abort(Ok(Decision::Denied(denial))),
                    Claim::Write(kind, lease) => match with_lock(code, doc, &lease) {
                        Ok(updated) => TxWrite::Commit(
                            updated,
                            Ok(Decision::Granted(Grant {
                                kind,
                                lease: Some(lease),
                                connection_path: record.connection().map(str::to_string),
                            })),
                        ),
                        Err(e) => TxWrite::Abort(Err(e)),
                    },
                }
            })
            .await??;

        match &decision {
            Decision::Granted(grant) => info!(
                code,
                holder = holder_id,
                kind = ?grant.kind,
                generation = grant.lease.as_ref().map_or(0, |l| l.generation),
                "Lease granted"
            ),
            Decision::Denied(denial) => warn!(
                code,
                holder = holder_id,
                current_holder = %denial.holder_id,
                current_platform = %denial.platform,
                renewed_at = %denial.renewed_at,
                "Lease denied, held elsewhere"
            ),
        }
        Ok(decision)
    }

    /// One renewal attempt with a detailed outcome.
    pub async fn try_renew(
        &self,
        code: &str,
        holder_id: &str,
        platform: &str,
        now: Timestamp,
    ) -> Result<RenewOutcome, LeaseError> {
        let Some(code) = normalize(code) else {
            return Ok(RenewOutcome::NoLease);
        };
        let path = self.code_path(code)?;
        let ttl = self.ttl;

        self.store
            .transact(&path, |doc| {
                let Some(doc) = doc else {
                    return TxWrite::Abort(Ok(RenewOutcome::NoLease));
                };
                let record = match decode(code, doc) {
                    Ok(record) => record,
                    Err(e) => return TxWrite::Abort(Err(e)),
                };
                if !record.active || record.is_expired(now) {
                    return TxWrite::Abort(Ok(RenewOutcome::Revoked));
                }
                let Some(current) = record.live_lock() else {
                    return TxWrite::Abort(Ok(RenewOutcome::NoLease));
                };

                match claim(Some(current), holder_id, platform, now, ttl) {
                    Claim::Blocked(denial) => TxWrite::Abort(Ok(RenewOutcome::Lost {
                        holder_id: denial.holder_id,
                    })),
                    Claim::Write(_, lease) => match with_lock(code, doc, &lease) {
                        Ok(updated) => TxWrite::Commit(updated, Ok(RenewOutcome::Renewed(lease))),
                        Err(e) => TxWrite::Abort(Err(e)),
                    },
                }
            })
            .await?
    }

    /// Best-effort renewal.
    ///
    /// Returns `false` only when the session must end: another holder owns a
    /// live lease, or the code was revoked. Transient failures return `true`
    /// so the next tick retries.
    pub async fn renew(&self, code: &str, holder_id: &str, platform: &str, now: Timestamp) -> bool {
        match self.try_renew(code, holder_id, platform, now).await {
            Ok(RenewOutcome::Renewed(lease)) => {
                debug!(code, holder = holder_id, renewed_at = %lease.renewed_at, "Lease renewed");
                true
            }
            Ok(RenewOutcome::NoLease) => {
                debug!(code, "Nothing to renew");
                true
            }
            Ok(RenewOutcome::Lost { holder_id: current }) => {
                warn!(code, holder = holder_id, current_holder = %current, "Lease lost to another holder");
                false
            }
            Ok(RenewOutcome::Revoked) => {
                warn!(code, holder = holder_id, "Code revoked or expired during session");
                false
            }
            Err(e) => {
                warn!(code, holder = holder_id, error = %e, "Lease renewal failed, will retry");
                true
            }
        }
    }

    /// Clear the lease if `holder_id` holds it. Failures are logged only.
    ///
    /// The holder fields are emptied but `generation` is kept, so the next
    /// holder still gets a higher fencing value.
    pub async fn release(&self, code: &str, holder_id: &str) {
        let Some(code) = normalize(code) else {
            return;
        };
        let path = match self.code_path(code) {
            Ok(path) => path,
            Err(e) => {
                warn!(code, error = %e, "Cannot release lease");
                return;
            }
        };

        let result = self
            .store
            .transact(&path, |doc| {
                let Some(doc) = doc else {
                    return TxWrite::Abort(Ok(false));
                };
                let record = match decode(code, doc) {
                    Ok(record) => record,
                    Err(e) => return TxWrite::Abort(Err(e)),
                };
                let Some(current) = record.live_lock().filter(|l| l.holder_id == holder_id) else {
                    return TxWrite::Abort(Ok(false));
                };
                let cleared = LeaseRecord::cleared(current.generation);
                match with_lock(code, doc, &cleared) {
                    Ok(updated) => TxWrite::Commit(updated, Ok(true)),
                    Err(e) => TxWrite::Abort(Err(e)),
                }
            })
            .await;

        match result {
            Ok(Ok(true)) => info!(code, holder = holder_id, "Lease released"),
            Ok(Ok(false)) => debug!(code, holder = holder_id, "Lease not held by caller, left untouched"),
            Ok(Err(e)) => warn!(code, holder = holder_id, error = %e, "Lease release failed"),
            Err(e) => warn!(code, holder = holder_id, error = %e, "Lease release failed"),
        }
    }

    /// Current lease state of a code.
    pub async fn status(&self, code: &str, now: Timestamp) -> Result<LeaseStatus, LeaseError> {
        let code = normalize(code).ok_or_else(|| LeaseError::NotFound(String::new()))?;
        let path = self.code_path(code)?;
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| LeaseError::NotFound(code.to_string()))?;
        let record = decode(code, &doc)?;
        let lease = record.live_lock().cloned();
        Ok(LeaseStatus {
            code: code.to_string(),
            active: record.active,
            expires_at: record.expires_at,
            age: lease.as_ref().map(|l| l.age(now)),
            stale: lease.as_ref().is_none_or(|l| l.is_stale(now, self.ttl)),
            lease,
        })
    }
}

/// A coordinator bound to one session's code and holder.
pub struct BoundLease<S> {
    coordinator: Arc<LeaseCoordinator<S>>,
    code: String,
    holder_id: String,
    platform: String,
}

impl<S> BoundLease<S> {
    pub fn new(
        coordinator: Arc<LeaseCoordinator<S>>,
        code: impl Into<String>,
        holder_id: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            code: code.into(),
            holder_id: holder_id.into(),
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> LeaseRenewer for BoundLease<S> {
    async fn renew(&self) -> bool {
        let now = match self.coordinator.now().await {
            Ok(now) => now,
            Err(e) => {
                warn!(code = %self.code, error = %e, "Cannot read store time, skipping renewal");
                return true;
            }
        };
        self.coordinator
            .renew(&self.code, &self.holder_id, &self.platform, now)
            .await
    }
}
