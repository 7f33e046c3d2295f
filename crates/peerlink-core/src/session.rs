//! Session controller: glues the signaling channel to the negotiation engine.

use std::sync::Arc;

use parking_lot::Mutex;
use peerlink_common::{PeerRole, SdpKind, SessionDescription, SignalingMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{EngineEvent, NegotiationEngine, NegotiationPhase};
use crate::error::{NegotiationError, SessionError};
use crate::resource::{MediaBackend, RemoteStream};
use crate::signaling::{ChannelEvent, SignalingChannel};

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered(String),
    RemoteStreamAvailable(RemoteStream),
    NegotiationFailed(NegotiationError),
    Ended { reason: String },
}

pub struct SessionController {
    role: PeerRole,
    channel: Arc<SignalingChannel>,
    engine: NegotiationEngine,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Connect to the signaling server and register the local role.
    pub async fn start(
        config: SessionConfig,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        config.validate()?;
        let role = config.role;

        let (channel, channel_events) = SignalingChannel::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (engine, engine_events) =
            NegotiationEngine::spawn(role, config.negotiation.clone(), backend, outbound_tx);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_inbound(role, engine.clone(), inbound_rx));

        let router = Router {
            role,
            channel: Arc::clone(&channel),
            engine: engine.clone(),
            events: events_tx,
            inbound: inbound_tx,
        };
        let handle = tokio::spawn(router.run(channel_events, engine_events, outbound_rx));

        if let Err(e) = channel.connect(role.identity(), &config.signaling_url).await {
            engine.teardown().await;
            handle.abort();
            return Err(e.into());
        }
        info!(role = %role, url = %config.signaling_url, "session started");

        let controller = Self {
            role,
            channel,
            engine,
            router: Mutex::new(Some(handle)),
        };
        Ok((controller, events_rx))
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.engine.phase()
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// Allocate the peer resource and attach local media ahead of the call.
    pub async fn connect_remote(&self) -> Result<(), SessionError> {
        self.engine.create_resource().await?;
        Ok(())
    }

    /// Send the first offer. Allocates the resource if `connect_remote` was
    /// not called.
    pub async fn start_call(&self) -> Result<(), SessionError> {
        if self.engine.phase() == NegotiationPhase::Idle {
            self.engine.create_resource().await?;
        }
        self.engine.start_as_initiator().await?;
        Ok(())
    }

    pub async fn renegotiate(&self) -> Result<(), SessionError> {
        self.engine.renegotiate().await?;
        Ok(())
    }

    /// Tear down negotiation, then close the signaling channel.
    pub async fn hangup(&self) {
        info!(role = %self.role, "hanging up");
        self.engine.teardown().await;
        self.channel.close();
    }

    /// Resolve once the router has stopped (the session ended).
    pub async fn closed(&self) {
        let handle = self.router.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct Router {
    role: PeerRole,
    channel: Arc<SignalingChannel>,
    engine: NegotiationEngine,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Feeds [`dispatch_inbound`], so an engine call in flight never blocks
    /// the router.
    inbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl Router {
    async fn run(
        self,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        loop {
            tokio::select! {
                Some(message) = outbound.recv() => {
                    if let Err(e) = self.channel.send(&message) {
                        warn!(role = %self.role, event = message.event(), "failed to send signaling message: {}", e);
                    }
                }
                Some(event) = engine_events.recv() => self.on_engine_event(event),
                event = channel_events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(reason) = self.on_channel_event(event) {
                        self.engine.teardown().await;
                        info!(role = %self.role, "session ended: {}", reason);
                        self.emit(SessionEvent::Ended { reason });
                        break;
                    }
                }
            }
        }
    }

    /// Returns the end reason when the channel has gone away.
    fn on_channel_event(&self, event: ChannelEvent) -> Option<String> {
        match event {
            ChannelEvent::Registered(identity) => {
                self.emit(SessionEvent::Registered(identity));
                None
            }
            ChannelEvent::Message(message) => {
                if message.receiver() != Some(self.role) {
                    debug!(role = %self.role, event = message.event(), "ignoring message addressed elsewhere");
                } else if self.inbound.send(message).is_err() {
                    warn!(role = %self.role, "inbound dispatcher is gone; message dropped");
                }
                None
            }
            ChannelEvent::Closed { code, reason } => {
                Some(format!("signaling closed ({code}): {reason}"))
            }
            ChannelEvent::TransportFailure(cause) => Some(format!("signaling transport failed: {cause}")),
        }
    }

    fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::PhaseChanged(phase) => {
                debug!(role = %self.role, ?phase, "negotiation phase changed")
            }
            EngineEvent::RemoteStreamAdded(stream) => {
                self.emit(SessionEvent::RemoteStreamAvailable(stream))
            }
            EngineEvent::Failed(error) => self.emit(SessionEvent::NegotiationFailed(error)),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Apply inbound signaling to the engine in arrival order.
async fn dispatch_inbound(
    role: PeerRole,
    engine: NegotiationEngine,
    mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let result = match message {
            SignalingMessage::Sdp { kind, body, .. } => match kind {
                SdpKind::Offer => {
                    engine
                        .apply_remote_offer(SessionDescription::offer(body))
                        .await
                }
                SdpKind::Answer => {
                    engine
                        .apply_remote_answer(SessionDescription::answer(body))
                        .await
                }
            },
            SignalingMessage::Trickle { candidate, .. } => {
                engine.add_remote_candidate(candidate).await.map(|_| ())
            }
            SignalingMessage::Register { .. } => Ok(()),
        };

        // Stage failures arrive as EngineEvent::Failed; only guard
        // rejections are reported here.
        match result {
            Err(NegotiationError::ClosedSession) => break,
            Err(e) if !e.is_fatal() => warn!(role = %role, "signaling message rejected: {}", e),
            _ => {}
        }
    }
}
