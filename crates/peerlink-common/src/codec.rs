//! JSON text codec for [`SignalingMessage`].

use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::SignalingMessage;

/// Why an inbound signaling frame could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Serialize a message to its wire text. Never fails.
pub fn encode(message: &SignalingMessage) -> String {
    let value = match message {
        SignalingMessage::Register { user_id } => json!({
            "event": "register",
            "userId": user_id,
        }),
        SignalingMessage::Sdp {
            kind,
            body,
            sender,
            receiver,
        } => json!({
            "event": "sdp",
            "type": kind.as_str(),
            "description": body,
            "sender": sender.identity(),
            "receiver": receiver.identity(),
        }),
        SignalingMessage::Trickle {
            candidate,
            sender,
            receiver,
        } => json!({
            "event": "trickle",
            "candidate": {
                "sdpMid": candidate.media_id,
                "sdpMLineIndex": candidate.media_line_index,
                "sdp": candidate.candidate,
            },
            "sender": sender.identity(),
            "receiver": receiver.identity(),
        }),
    };
    value.to_string()
}

/// Parse wire text. The `event` discriminator is checked before any other
/// field so unknown kinds are reported as such rather than as malformed.
pub fn decode(text: &str) -> Result<SignalingMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    match value.get("event").and_then(Value::as_str) {
        Some("register" | "sdp" | "trickle") => {}
        Some(other) => return Err(DecodeError::UnknownKind(other.to_string())),
        None => {
            return Err(DecodeError::MalformedPayload(
                "missing string field `event`".into(),
            ))
        }
    }

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}
