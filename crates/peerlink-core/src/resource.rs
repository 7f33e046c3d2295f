//! Seam between the negotiation core and the media engine.
//!
//! The engine never touches a concrete peer connection; it drives a
//! [`PeerResource`] obtained from a [`MediaBackend`]. SDP operations are
//! async and report failure through [`ResourceResult`], and asynchronous
//! signals from the media engine (gathered candidates, remote tracks) arrive
//! as [`ResourceEvent`]s on the channel handed over at creation.

use std::sync::Arc;

use async_trait::async_trait;
use peerlink_common::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::LocalMedia;

/// Failure reported by the media engine. Only the message crosses the seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ResourceError(pub String);

impl ResourceError {
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Parameters for allocating a peer resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// STUN/TURN URIs handed to the ICE agent.
    pub ice_servers: Vec<String>,
    pub local_media: LocalMedia,
}

/// A remote track announced by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    /// `audio` or `video`.
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    CandidateGathered(IceCandidate),
    RemoteStreamAdded(RemoteStream),
}

/// Factory for peer resources.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn create_resource(
        &self,
        config: &ResourceConfig,
        events: mpsc::UnboundedSender<ResourceEvent>,
    ) -> ResourceResult<Arc<dyn PeerResource>>;
}

/// One peer-connection-equivalent, exclusively owned by a negotiation engine.
#[async_trait]
pub trait PeerResource: Send + Sync {
    async fn create_offer(&self) -> ResourceResult<SessionDescription>;

    async fn create_answer(&self) -> ResourceResult<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> ResourceResult<()>;

    async fn set_remote_description(&self, description: &SessionDescription)
        -> ResourceResult<()>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> ResourceResult<()>;

    /// Release the underlying connection. Called exactly once.
    async fn dispose(&self);
}
