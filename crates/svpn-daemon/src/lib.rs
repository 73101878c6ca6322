//! SimpleVPN Daemon Library
//!
//! Core functionality for the SimpleVPN client:
//! - Document store backends (`SQLite`, in-memory)
//! - Redemption-code lease coordinator
//! - Heartbeat task keeping a lease alive
//! - Tunnel engine process management
//! - Session state machine tying them together
//! - Administrative helpers for codes and descriptors

pub mod admin;
pub mod heartbeat;
pub mod lease;
pub mod session;
pub mod storage;
pub mod tunnel;
