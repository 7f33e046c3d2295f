//! Error types for the signaling channel, negotiation engine and session.

use std::time::Duration;

use peerlink_common::{PeerRole, SdpKind};
use thiserror::Error;

use crate::engine::NegotiationPhase;

/// Signaling transport failure. Reported upward, never retried here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect signaling transport: {0}")]
    Connect(String),

    #[error("signaling channel is not connected")]
    NotConnected,
}

/// Negotiation failure.
///
/// Stage failures (`CreateResourceFailed` through `NegotiationTimeout`) move
/// the engine to `Failed`; guard rejections leave the state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create peer resource: {0}")]
    CreateResourceFailed(String),

    #[error("failed to create local description: {0}")]
    CreateDescriptionFailed(String),

    #[error("failed to apply local description: {0}")]
    SetLocalFailed(String),

    #[error("failed to apply remote description: {0}")]
    SetRemoteFailed(String),

    #[error("failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("negotiation did not reach a stable state within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("peer resource already exists")]
    ResourceAlreadyExists,

    #[error("session is closed")]
    ClosedSession,

    #[error("{operation} is not valid in phase {phase:?}")]
    InvalidState {
        operation: &'static str,
        phase: NegotiationPhase,
    },

    #[error("{operation} is not permitted for role {role}")]
    RoleMismatch {
        operation: &'static str,
        role: PeerRole,
    },

    #[error("expected {expected:?} description, got {actual:?}")]
    UnexpectedDescription { expected: SdpKind, actual: SdpKind },
}

impl NegotiationError {
    /// Whether this error ended the current negotiation round.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NegotiationError::CreateResourceFailed(_)
                | NegotiationError::CreateDescriptionFailed(_)
                | NegotiationError::SetLocalFailed(_)
                | NegotiationError::SetRemoteFailed(_)
                | NegotiationError::CreateAnswerFailed(_)
                | NegotiationError::NegotiationTimeout(_)
        )
    }
}

/// Error surfaced by [`crate::session::SessionController`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Config(#[from] peerlink_common::Error),
}
