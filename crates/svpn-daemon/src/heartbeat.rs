//! Periodic lease renewal bound to a session.
//!
//! One task per session. Renewals are awaited inline so at most one is in
//! flight; ticks missed while a renewal is pending are skipped, not queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default bound for a single renewal.
pub const DEFAULT_RENEW_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can renew a lease.
#[async_trait]
pub trait LeaseRenewer: Send + Sync {
    /// `false` means the lease is gone and the session must end.
    async fn renew(&self) -> bool;
}

/// Signals emitted by the heartbeat task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    LeaseLost,
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Start/stop handle for the heartbeat task.
pub struct HeartbeatScheduler {
    interval: Duration,
    renew_timeout: Duration,
    task: Option<RunningTask>,
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RENEW_TIMEOUT)
    }
}

impl HeartbeatScheduler {
    pub const fn new(interval: Duration, renew_timeout: Duration) -> Self {
        Self {
            interval,
            renew_timeout,
            task: None,
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the task is alive. A task that exited after losing the lease
    /// counts as stopped.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Start renewing. Returns `false` (and does nothing) if already running.
    pub fn start(
        &mut self,
        renewer: Arc<dyn LeaseRenewer>,
        signals: mpsc::Sender<HeartbeatSignal>,
    ) -> bool {
        if self.is_running() {
            debug!("Heartbeat already running");
            return false;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_heartbeat_task(
            renewer,
            self.interval,
            self.renew_timeout,
            signals,
            shutdown_rx,
        );
        self.task = Some(RunningTask {
            shutdown: shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the task and wait for it to finish. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }
}

fn spawn_heartbeat_task(
    renewer: Arc<dyn LeaseRenewer>,
    interval: Duration,
    renew_timeout: Duration,
    signals: mpsc::Sender<HeartbeatSignal>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => {
                    info!("Heartbeat task shutting down");
                    return;
                }
            }

            let alive = match tokio::time::timeout(renew_timeout, renewer.renew()).await {
                Ok(alive) => alive,
                Err(_) => {
                    warn!(timeout_ms = renew_timeout.as_millis(), "Lease renewal timed out, will retry");
                    true
                }
            };

            if !alive {
                warn!("Lease lost, stopping heartbeat");
                let _ = signals.send(HeartbeatSignal::LeaseLost).await;
                return;
            }
        }
    })
}
