//! PeerLink negotiation core.
//!
//! Drives a two-party WebRTC-style session: a [`SignalingChannel`] carries
//! register/sdp/trickle messages through a rendezvous server, a
//! [`NegotiationEngine`] runs the offer/answer and candidate exchange
//! against a [`PeerResource`], and a [`SessionController`] wires the two
//! together.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod resource;
pub mod session;
pub mod signaling;
pub mod webrtc_backend;

pub use config::{LocalMedia, NegotiationConfig, SessionConfig};
pub use engine::{CandidateDisposition, EngineEvent, NegotiationEngine, NegotiationPhase};
pub use error::{NegotiationError, SessionError, TransportError};
pub use resource::{
    MediaBackend, PeerResource, RemoteStream, ResourceConfig, ResourceError, ResourceEvent,
    ResourceResult,
};
pub use session::{SessionController, SessionEvent};
pub use signaling::{ChannelEvent, ChannelState, SignalingChannel};
pub use webrtc_backend::WebRtcBackend;
