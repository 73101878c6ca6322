//! SimpleVPN Core Library
//!
//! Shared functionality for SimpleVPN components:
//! - Document store contract used by the lease coordinator
//! - Connection descriptor → tunnel configuration compiler
//! - Device identity and local state files
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod identity;
pub mod local_state;
pub mod time;
pub mod tracing_init;
pub mod tunnel_config;

pub use config::Config;
pub use document::{DocPath, Document, DocumentStore, StoreError, TxWrite};
pub use error::{Error, Result};
pub use time::Timestamp;
