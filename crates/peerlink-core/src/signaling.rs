//! WebSocket transport to the rendezvous server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peerlink_common::{codec, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;

pub const MANUAL_CLOSE_CODE: u16 = 1000;
pub const MANUAL_CLOSE_REASON: &str = "manual close";

/// Reported for a close frame that carries no status code.
const NO_STATUS_CODE: u16 = 1005;
/// Reported when the stream ends without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Connecting,
    Opened,
    Closed,
    Failed,
}

fn next_state(current: ChannelState, transition: Transition) -> ChannelState {
    match (current, transition) {
        (ChannelState::Disconnected, Transition::Connecting) => ChannelState::Connecting,
        (ChannelState::Connecting, Transition::Opened) => ChannelState::Connected,
        (_, Transition::Closed | Transition::Failed) => ChannelState::Disconnected,
        (current, _) => current,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Registration was sent right after the socket opened.
    Registered(String),
    Message(SignalingMessage),
    Closed { code: u16, reason: String },
    TransportFailure(String),
}

pub struct SignalingChannel {
    state: watch::Sender<ChannelState>,
    /// Queue feeding the socket writer task; present while connected.
    outgoing: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl SignalingChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let channel = Arc::new(Self {
            state,
            outgoing: Mutex::new(None),
            events,
        });
        (channel, events_rx)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Open the socket and register `identity` with the server.
    pub async fn connect(self: &Arc<Self>, identity: &str, endpoint: &str) -> Result<(), TransportError> {
        if !self.transition(Transition::Connecting) {
            return Err(TransportError::Connect(format!(
                "channel is already {:?}",
                self.state()
            )));
        }

        let (ws_stream, _) = match connect_async(endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to connect to signaling server {}: {}", endpoint, e);
                self.transition(Transition::Failed);
                let _ = self.events.send(ChannelEvent::TransportFailure(e.to_string()));
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        info!("Connected to signaling server: {}", endpoint);

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Failed to write to signaling socket: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        *self.outgoing.lock() = Some(out_tx);
        self.transition(Transition::Opened);

        self.send(&SignalingMessage::register(identity))?;
        info!(identity, "Registered with signaling server");
        let _ = self.events.send(ChannelEvent::Registered(identity.to_string()));

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed = None;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match codec::decode(&text) {
                        Ok(message) => {
                            debug!(event = message.event(), "Received signaling message");
                            let _ = channel.events.send(ChannelEvent::Message(message));
                        }
                        Err(e) => warn!("Dropping undecodable signaling message: {}", e),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        closed = Some(close_event(frame));
                        break;
                    }
                    Err(e) => {
                        error!("Signaling WebSocket error: {}", e);
                        closed = Some(ChannelEvent::TransportFailure(e.to_string()));
                        break;
                    }
                    _ => {}
                }
            }

            // The writer queue is already gone if close() was called locally.
            let closed_locally = channel.outgoing.lock().take().is_none();
            let event = if closed_locally {
                ChannelEvent::Closed {
                    code: MANUAL_CLOSE_CODE,
                    reason: MANUAL_CLOSE_REASON.to_string(),
                }
            } else {
                closed.unwrap_or(ChannelEvent::Closed {
                    code: ABNORMAL_CLOSE_CODE,
                    reason: "connection lost".to_string(),
                })
            };
            let transition = match event {
                ChannelEvent::TransportFailure(_) => Transition::Failed,
                _ => Transition::Closed,
            };
            channel.transition(transition);
            info!("Signaling channel closed: {:?}", event);
            let _ = channel.events.send(event);
        });

        Ok(())
    }

    pub fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        self.send_text(codec::encode(message))
    }

    /// Transmit raw text. Fails with `NotConnected` unless connected; nothing
    /// is queued for later.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state() != ChannelState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(WsMessage::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Close with code 1000 "manual close". Does nothing if already closed.
    pub fn close(&self) {
        let Some(tx) = self.outgoing.lock().take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::from(MANUAL_CLOSE_CODE),
            reason: MANUAL_CLOSE_REASON.into(),
        };
        let _ = tx.send(WsMessage::Close(Some(frame)));
        self.transition(Transition::Closed);
        info!("Signaling channel closed locally");
    }

    fn transition(&self, transition: Transition) -> bool {
        self.state.send_if_modified(|state| {
            let next = next_state(*state, transition);
            let changed = next != *state;
            *state = next;
            changed
        })
    }
}

fn close_event(frame: Option<CloseFrame<'_>>) -> ChannelEvent {
    match frame {
        Some(frame) => ChannelEvent::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => ChannelEvent::Closed {
            code: NO_STATUS_CODE,
            reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_cycle() {
        let mut state = ChannelState::Disconnected;
        for (transition, expected) in [
            (Transition::Connecting, ChannelState::Connecting),
            (Transition::Opened, ChannelState::Connected),
            (Transition::Closed, ChannelState::Disconnected),
        ] {
            state = next_state(state, transition);
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_open_requires_connect_attempt() {
        assert_eq!(
            next_state(ChannelState::Disconnected, Transition::Opened),
            ChannelState::Disconnected
        );
        assert_eq!(
            next_state(ChannelState::Connected, Transition::Connecting),
            ChannelState::Connected
        );
    }

    #[test]
    fn test_failure_disconnects_from_any_state() {
        for state in [
            ChannelState::Disconnected,
            ChannelState::Connecting,
            ChannelState::Connected,
        ] {
            assert_eq!(next_state(state, Transition::Failed), ChannelState::Disconnected);
        }
    }

    #[test]
    fn test_close_frame_without_status() {
        assert_eq!(
            close_event(None),
            ChannelEvent::Closed {
                code: 1005,
                reason: String::new(),
            }
        );
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        };
        assert_eq!(
            close_event(Some(frame)),
            ChannelEvent::Closed {
                code: 1001,
                reason: "restarting".to_string(),
            }
        );
    }

    #[test]
    fn test_send_before_connect_is_rejected() {
        let (channel, _events) = SignalingChannel::new();
        assert_eq!(
            channel.send(&SignalingMessage::register("Sender")),
            Err(TransportError::NotConnected)
        );
        channel.close();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
