//! Session controller types.

use std::fmt;
use std::time::Duration;

use svpn_core::config::Config;
use svpn_core::document::StoreError;
use svpn_core::time::Timestamp;
use svpn_core::tunnel_config::{CompileOptions, DescriptorError};

use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RENEW_TIMEOUT};
use crate::lease::{Grant, LeaseError};
use crate::storage::CatalogError;
use crate::tunnel::TunnelError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Configuring,
    Starting,
    Connected,
    Stopping,
    Failed,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Configuring => "configuring",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published controller status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: SessionState,
    pub message: String,
}

impl Status {
    pub fn new(state: SessionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserDisconnect,
    LeaseLost,
}

impl StopReason {
    pub const fn message(self) -> &'static str {
        match self {
            Self::UserDisconnect => "Disconnected",
            Self::LeaseLost => "Lease lost",
        }
    }
}

/// The active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// `None` in lock-free mode.
    pub code: Option<String>,
    pub holder_id: String,
    pub platform: String,
    pub grant: Grant,
    /// Distinguishes this session from earlier ones on the same controller.
    pub epoch: u64,
    /// Store time at acquisition.
    pub connected_at: Timestamp,
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub platform: String,
    pub heartbeat_interval: Duration,
    pub renew_timeout: Duration,
    pub compile: CompileOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            platform: svpn_core::config::default_platform().to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            renew_timeout: DEFAULT_RENEW_TIMEOUT,
            compile: CompileOptions::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            platform: config.platform.clone(),
            heartbeat_interval: config.lease.heartbeat_interval(),
            renew_timeout: config.lease.renew_timeout(),
            compile: config.tunnel.compile_options(),
        }
    }
}

/// Reasons a connect attempt fails.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A session is already active or in progress")]
    Busy,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Code is held by {holder_id} ({platform}), last renewed at {renewed_at}")]
    Denied {
        holder_id: String,
        platform: String,
        renewed_at: Timestamp,
    },

    #[error("Code {0} is not active")]
    Inactive(String),

    #[error("Code {0} has expired")]
    Expired(String),

    #[error("Malformed connection descriptor: {0}")]
    MalformedDescriptor(#[from] DescriptorError),

    #[error("Device identity unavailable: {0}")]
    Identity(String),

    #[error("Store error: {0}")]
    Transport(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Connect cancelled")]
    Cancelled,
}

impl SessionError {
    /// Short human-readable status line.
    pub const fn status_message(&self) -> &'static str {
        match self {
            Self::Busy => "Already connected",
            Self::NotFound(_) => "Code not found",
            Self::Denied { .. } => "Code is in use on another device",
            Self::Inactive(_) => "Code is not active",
            Self::Expired(_) => "Code has expired",
            Self::MalformedDescriptor(_) => "Connection settings are invalid",
            Self::Identity(_) => "Device identity unavailable",
            Self::Transport(_) => "Service unreachable, try again",
            Self::Tunnel(_) => "Tunnel failed to start",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl From<LeaseError> for SessionError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::NotFound(code) => Self::NotFound(format!("code {code}")),
            LeaseError::Inactive(code) => Self::Inactive(code),
            LeaseError::Expired(code) => Self::Expired(code),
            corrupt @ LeaseError::Corrupt { .. } => Self::Transport(corrupt.to_string()),
            LeaseError::Store(e) => Self::Transport(e.to_string()),
        }
    }
}

impl From<CatalogError> for SessionError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::MissingDocument(path) | CatalogError::MissingDescriptor(path) => {
                Self::NotFound(format!("connection {path}"))
            }
            CatalogError::Store(e) => Self::Transport(e.to_string()),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Transport(e.to_string())
    }
}
