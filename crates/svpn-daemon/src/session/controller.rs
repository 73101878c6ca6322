//! Session controller.
//!
//! Drives one connection at a time through
//! `Idle → Acquiring → Configuring → Starting → Connected → Stopping → Idle`.
//! Every transition happens under one async mutex; a connect in flight can
//! still be cancelled through its token.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svpn_core::document::DocumentStore;
use svpn_core::identity::IdentityProvider;
use svpn_core::local_state::LocalState;
use svpn_core::tunnel_config::{TunnelConfig, compile_with};

use super::types::{Session, SessionError, SessionOptions, SessionState, Status, StopReason};
use crate::heartbeat::{HeartbeatScheduler, HeartbeatSignal};
use crate::lease::{BoundLease, Decision, Grant, LeaseCoordinator};
use crate::tunnel::TunnelProcess;

struct Slot {
    session: Option<Session>,
    heartbeat: HeartbeatScheduler,
    epoch: u64,
}

struct Inner<S, T> {
    coordinator: Arc<LeaseCoordinator<S>>,
    tunnel: Arc<T>,
    identity: Arc<dyn IdentityProvider>,
    local_state: Option<LocalState>,
    options: SessionOptions,
    slot: Mutex<Slot>,
    /// Set while a connect attempt is running.
    connecting: AtomicBool,
    pending: std::sync::Mutex<Option<CancellationToken>>,
    status: watch::Sender<Status>,
}

/// Cheaply cloneable handle to a session controller.
pub struct SessionController<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for SessionController<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the in-progress flag when a connect attempt ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run `fut` unless `token` is cancelled first.
async fn guarded<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

impl<S, T> SessionController<S, T>
where
    S: DocumentStore + 'static,
    T: TunnelProcess + 'static,
{
    pub fn new(
        coordinator: Arc<LeaseCoordinator<S>>,
        tunnel: Arc<T>,
        identity: Arc<dyn IdentityProvider>,
        options: SessionOptions,
        local_state: Option<LocalState>,
    ) -> Self {
        let heartbeat = HeartbeatScheduler::new(options.heartbeat_interval, options.renew_timeout);
        let (status, _) = watch::channel(Status::new(SessionState::Idle, "Disconnected"));
        Self {
            inner: Arc::new(Inner {
                coordinator,
                tunnel,
                identity,
                local_state,
                options,
                slot: Mutex::new(Slot {
                    session: None,
                    heartbeat,
                    epoch: 0,
                }),
                connecting: AtomicBool::new(false),
                pending: std::sync::Mutex::new(None),
                status,
            }),
        }
    }

    /// Latest published status.
    pub fn status(&self) -> Status {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// The active session, if connected.
    pub async fn session(&self) -> Option<Session> {
        self.inner.slot.lock().await.session.clone()
    }

    /// Whether the heartbeat task is alive.
    pub async fn heartbeat_running(&self) -> bool {
        self.inner.slot.lock().await.heartbeat.is_running()
    }

    fn publish(&self, state: SessionState, message: &str) {
        debug!(%state, message, "Session state changed");
        self.inner.status.send_replace(Status::new(state, message));
    }

    fn set_pending(&self, token: Option<CancellationToken>) {
        *self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn take_pending(&self) -> Option<CancellationToken> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Connect using `code`; `None` or an empty code selects the lock-free
    /// default connection.
    ///
    /// Fails with [`SessionError::Busy`] unless idle. Cancelling `cancel`, or
    /// calling [`disconnect`](Self::disconnect), aborts the attempt and rolls
    /// back any acquired lease.
    pub async fn connect(
        &self,
        code: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Session, SessionError> {
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Busy);
        }
        let _connecting = ConnectingGuard(&self.inner.connecting);
        let mut slot = self.inner.slot.lock().await;
        if slot.session.is_some() {
            return Err(SessionError::Busy);
        }

        let code = code
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let token = cancel.child_token();
        self.set_pending(Some(token.clone()));
        let result = self.establish(&mut slot, code, &token).await;
        self.set_pending(None);

        if let Err(e) = &result {
            warn!(error = %e, "Connect failed");
            self.publish(SessionState::Failed, e.status_message());
            self.publish(SessionState::Idle, e.status_message());
        }
        result
    }

    async fn establish(
        &self,
        slot: &mut Slot,
        code: Option<String>,
        token: &CancellationToken,
    ) -> Result<Session, SessionError> {
        let coordinator = &self.inner.coordinator;
        let platform = self.inner.options.platform.clone();
        let code_str = code.as_deref().unwrap_or("");

        self.publish(SessionState::Acquiring, "Checking code");
        let holder_id = self
            .inner
            .identity
            .ensure_identity()
            .map_err(|e| SessionError::Identity(e.to_string()))?;
        let now = guarded(token, coordinator.now()).await??;

        let decision = match guarded(
            token,
            coordinator.acquire_or_resume(code_str, &holder_id, &platform, now),
        )
        .await
        {
            Ok(decision) => decision?,
            Err(cancelled) => {
                coordinator.release(code_str, &holder_id).await;
                return Err(cancelled);
            }
        };
        let grant = match decision {
            Decision::Granted(grant) => grant,
            Decision::Denied(denial) => {
                return Err(SessionError::Denied {
                    holder_id: denial.holder_id,
                    platform: denial.platform,
                    renewed_at: denial.renewed_at,
                });
            }
        };

        self.publish(SessionState::Configuring, "Preparing tunnel");
        let config = match self.prepare(&grant, token).await {
            Ok(config) => config,
            Err(e) => {
                coordinator.release(code_str, &holder_id).await;
                return Err(e);
            }
        };

        self.publish(SessionState::Starting, "Starting tunnel");
        if let Err(e) = self.launch(&config, token).await {
            if let Err(stop_err) = self.inner.tunnel.stop().await {
                warn!(error = %stop_err, "Failed to stop tunnel after failed start");
            }
            coordinator.release(code_str, &holder_id).await;
            return Err(e);
        }

        slot.epoch += 1;
        let epoch = slot.epoch;
        if let Some(code) = &code {
            let (signals_tx, signals_rx) = mpsc::channel(1);
            let renewer = Arc::new(BoundLease::new(
                Arc::clone(coordinator),
                code.clone(),
                holder_id.clone(),
                platform.clone(),
            ));
            slot.heartbeat.start(renewer, signals_tx);
            self.spawn_supervisor(epoch, signals_rx);

            if let Some(local) = &self.inner.local_state
                && let Err(e) = local.save_last_code(code)
            {
                warn!(error = %e, "Failed to remember last code");
            }
        }

        let session = Session {
            code,
            holder_id,
            platform,
            grant,
            epoch,
            connected_at: now,
        };
        info!(
            code = session.code.as_deref().unwrap_or("<none>"),
            holder = %session.holder_id,
            epoch,
            "Session connected"
        );
        slot.session = Some(session.clone());
        self.publish(SessionState::Connected, "Connected");
        Ok(session)
    }

    async fn prepare(
        &self,
        grant: &Grant,
        token: &CancellationToken,
    ) -> Result<TunnelConfig, SessionError> {
        let coordinator = &self.inner.coordinator;
        let catalog = coordinator.catalog();
        let path = catalog.connection_path(grant.connection_path.as_deref())?;
        let descriptor = guarded(
            token,
            catalog.fetch_descriptor(coordinator.store().as_ref(), &path),
        )
        .await??;
        Ok(compile_with(&descriptor, &self.inner.options.compile)?)
    }

    async fn launch(
        &self,
        config: &TunnelConfig,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        guarded(token, self.inner.tunnel.configure(config)).await??;
        guarded(token, self.inner.tunnel.start()).await??;
        Ok(())
    }

    fn spawn_supervisor(&self, epoch: u64, mut signals: mpsc::Receiver<HeartbeatSignal>) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Some(HeartbeatSignal::LeaseLost) = signals.recv().await {
                controller.on_lease_lost(epoch).await;
            }
        });
    }

    async fn on_lease_lost(&self, epoch: u64) {
        let mut slot = self.inner.slot.lock().await;
        if slot.session.as_ref().is_none_or(|s| s.epoch != epoch) {
            debug!(epoch, "Ignoring lease loss from an earlier session");
            return;
        }
        if let Some(session) = slot.session.take() {
            self.teardown(&mut slot, session, StopReason::LeaseLost).await;
        }
    }

    /// Disconnect, or cancel a connect in flight.
    ///
    /// Returns `false` when there was nothing to do.
    pub async fn disconnect(&self) -> bool {
        let cancelled = if let Some(token) = self.take_pending() {
            token.cancel();
            true
        } else {
            false
        };
        let mut slot = self.inner.slot.lock().await;
        let Some(session) = slot.session.take() else {
            return cancelled;
        };
        self.teardown(&mut slot, session, StopReason::UserDisconnect)
            .await;
        true
    }

    async fn teardown(&self, slot: &mut Slot, session: Session, reason: StopReason) {
        self.publish(SessionState::Stopping, "Disconnecting");
        slot.heartbeat.stop().await;
        if let Err(e) = self.inner.tunnel.stop().await {
            warn!(error = %e, "Failed to stop tunnel");
        }
        if reason == StopReason::UserDisconnect
            && let Some(code) = &session.code
        {
            self.inner
                .coordinator
                .release(code, &session.holder_id)
                .await;
        }
        info!(
            code = session.code.as_deref().unwrap_or("<none>"),
            epoch = session.epoch,
            reason = reason.message(),
            "Session ended"
        );
        self.publish(SessionState::Idle, reason.message());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use svpn_core::identity::DeviceIdentity;

    use crate::storage::{Catalog, MemoryStore};
    use crate::tunnel::TunnelError;

    #[derive(Default)]
    struct IdleTunnel {
        running: AtomicBool,
    }

    #[async_trait]
    impl TunnelProcess for IdleTunnel {
        async fn configure(&self, _config: &TunnelConfig) -> Result<(), TunnelError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), TunnelError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), TunnelError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    async fn controller() -> SessionController<MemoryStore, IdleTunnel> {
        let store = Arc::new(MemoryStore::new());
        let serde_json::Value::Object(doc) =
            json!({"descriptor": "vless://uuid@host:443?sni=example.com"})
        else {
            unreachable!("fixture must be an object");
        };
        store.insert(&"configs/current".parse().unwrap(), doc).await;
        let coordinator = Arc::new(LeaseCoordinator::new(
            store,
            Catalog::default(),
            Duration::from_secs(120),
        ));
        SessionController::new(
            coordinator,
            Arc::new(IdleTunnel::default()),
            Arc::new(DeviceIdentity::new("H1").unwrap()),
            SessionOptions::default(),
            None,
        )
    }

    #[tokio::test]
    async fn concurrent_read_does_not_make_connect_busy() {
        let controller = controller().await;

        // Hold the slot the way a `session()` reader would.
        let reader = controller.inner.slot.lock().await;
        let connecting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect(None, CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        assert!(!connecting.is_finished());
        drop(reader);

        let session = connecting.await.unwrap().unwrap();
        assert!(session.code.is_none());
        assert_eq!(controller.status().state, SessionState::Connected);
    }

    #[tokio::test]
    async fn second_connect_while_connecting_is_busy() {
        let controller = controller().await;

        let reader = controller.inner.slot.lock().await;
        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.connect(None, CancellationToken::new()).await })
        };
        while !controller.inner.connecting.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            controller.connect(None, CancellationToken::new()).await,
            Err(SessionError::Busy)
        ));
        drop(reader);

        first.await.unwrap().unwrap();
        assert!(!controller.inner.connecting.load(Ordering::SeqCst));
        assert!(matches!(
            controller.connect(None, CancellationToken::new()).await,
            Err(SessionError::Busy)
        ));
    }
}
