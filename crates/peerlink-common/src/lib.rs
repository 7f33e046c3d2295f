//! Shared utilities for PeerLink: signaling protocol, logging, error types.
//!
//! This crate provides the wire protocol and common infrastructure used by
//! the negotiation core, the rendezvous gateway and the CLI.

#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod protocol;

pub use codec::{decode, encode, DecodeError};
pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
