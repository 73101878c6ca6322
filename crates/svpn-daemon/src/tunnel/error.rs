//! Tunnel engine error types.

use std::path::PathBuf;
use std::time::Duration;

/// Errors from configuring, starting or stopping the tunnel engine.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel engine binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn tunnel engine: {0}")]
    Spawn(String),

    #[error("Tunnel engine exited during startup ({status})")]
    ExitedEarly { status: String },

    #[error("Tunnel engine not ready after {}ms", .0.as_millis())]
    NotReady(Duration),

    #[error("Invalid tunnel configuration: {0}")]
    Config(String),
}
