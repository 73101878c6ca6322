//! Tunnel engine configuration compiler.
//!
//! Turns an opaque `vless://` connection descriptor into the structured
//! configuration the external tunnel engine reads at startup.

mod compiler;
mod descriptor;
mod types;

pub use compiler::{
    BYPASS_DOMAIN_SUFFIXES, CompileOptions, DEFAULT_ALPN, DEFAULT_FINGERPRINT,
    DEFAULT_PACKET_ENCODING, compile, compile_with,
};
pub use descriptor::{DEFAULT_PORT, Descriptor, DescriptorError, DescriptorParams, SCHEME};
pub use types::*;
