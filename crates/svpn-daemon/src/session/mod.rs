//! Connection session state machine.

mod controller;
mod types;

pub use controller::SessionController;
pub use types::{Session, SessionError, SessionOptions, SessionState, Status, StopReason};
