//! External tunnel engine.

mod error;
mod process;

pub use error::TunnelError;
pub use process::{EngineOptions, SingBoxProcess, TunnelProcess, resolve_binary};
