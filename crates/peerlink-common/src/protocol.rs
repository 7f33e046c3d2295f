use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Which side of the two-party session this endpoint plays.
///
/// The initiator sends the first offer; the responder answers. On the wire
/// the roles double as the identities the rendezvous server routes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    #[serde(rename = "Sender")]
    Initiator,
    #[serde(rename = "Receiver")]
    Responder,
}

impl PeerRole {
    /// Identity label used for registration and message stamping.
    pub fn identity(self) -> &'static str {
        match self {
            PeerRole::Initiator => "Sender",
            PeerRole::Responder => "Receiver",
        }
    }

    pub fn remote(self) -> PeerRole {
        match self {
            PeerRole::Initiator => PeerRole::Responder,
            PeerRole::Responder => PeerRole::Initiator,
        }
    }

    pub fn from_identity(identity: &str) -> Option<PeerRole> {
        match identity {
            "Sender" => Some(PeerRole::Initiator),
            "Receiver" => Some(PeerRole::Responder),
            _ => None,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

// Some peers print the SDP type in upper case ("OFFER"), so accept any case.
impl<'de> Deserialize<'de> for SdpKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpKind::Offer),
            "answer" => Ok(SdpKind::Answer),
            other => Err(serde::de::Error::unknown_variant(other, &["offer", "answer"])),
        }
    }
}

/// An SDP offer or answer. The body is opaque to the negotiation core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub body: String,
}

impl SessionDescription {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            body: body.into(),
        }
    }
}

/// One trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMLineIndex")]
    pub media_line_index: u16,
    #[serde(rename = "sdpMid")]
    pub media_id: String,
    #[serde(rename = "sdp")]
    pub candidate: String,
}

/// Signaling message exchanged through the rendezvous server.
///
/// `sender` and `receiver` are role labels, not transport addresses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SignalingMessage {
    Register {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Sdp {
        #[serde(rename = "type")]
        kind: SdpKind,
        #[serde(rename = "description")]
        body: String,
        sender: PeerRole,
        receiver: PeerRole,
    },
    Trickle {
        candidate: IceCandidate,
        sender: PeerRole,
        receiver: PeerRole,
    },
}

impl SignalingMessage {
    pub fn register(user_id: impl Into<String>) -> Self {
        SignalingMessage::Register {
            user_id: user_id.into(),
        }
    }

    /// Wrap a local description, stamped from `local`'s point of view.
    pub fn sdp(description: SessionDescription, local: PeerRole) -> Self {
        SignalingMessage::Sdp {
            kind: description.kind,
            body: description.body,
            sender: local,
            receiver: local.remote(),
        }
    }

    /// Wrap a locally gathered candidate, stamped from `local`'s point of view.
    pub fn trickle(candidate: IceCandidate, local: PeerRole) -> Self {
        SignalingMessage::Trickle {
            candidate,
            sender: local,
            receiver: local.remote(),
        }
    }

    /// Wire discriminator of this message.
    pub fn event(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::Sdp { .. } => "sdp",
            SignalingMessage::Trickle { .. } => "trickle",
        }
    }

    /// Intended recipient, if the message is addressed to a peer.
    pub fn receiver(&self) -> Option<PeerRole> {
        match self {
            SignalingMessage::Register { .. } => None,
            SignalingMessage::Sdp { receiver, .. } | SignalingMessage::Trickle { receiver, .. } => {
                Some(*receiver)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_identity_is_symmetric() {
        for role in [PeerRole::Initiator, PeerRole::Responder] {
            assert_eq!(PeerRole::from_identity(role.identity()), Some(role));
            assert_eq!(role.remote().remote(), role);
        }
        assert_eq!(PeerRole::from_identity("Observer"), None);
    }

    #[test]
    fn test_sdp_message_is_stamped_from_local_role() {
        let msg = SignalingMessage::sdp(SessionDescription::answer("v=0"), PeerRole::Responder);
        match msg {
            SignalingMessage::Sdp {
                kind,
                sender,
                receiver,
                ..
            } => {
                assert_eq!(kind, SdpKind::Answer);
                assert_eq!(sender, PeerRole::Responder);
                assert_eq!(receiver, PeerRole::Initiator);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
