//! Common error types for PeerLink.

use thiserror::Error;

/// Result type alias using PeerLink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration and protocol-level failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<crate::codec::DecodeError> for Error {
    fn from(err: crate::codec::DecodeError) -> Self {
        Self::protocol(err)
    }
}
