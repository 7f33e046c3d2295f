//! SDP offer/answer and ICE trickle state machine.
//!
//! A [`NegotiationEngine`] is a cheap handle to an actor task that owns the
//! negotiation state and the peer resource. Commands are processed one at a
//! time, which makes the actor the only place negotiation state is mutated.
//! Resource SDP operations are awaited inside the actor but raced against
//! teardown and the negotiation deadline, so `teardown()` preempts an
//! in-flight step and nothing completes against a closed session. Resource
//! events are still handled while a step is pending.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use peerlink_common::{IceCandidate, PeerRole, SdpKind, SessionDescription, SignalingMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NegotiationConfig;
use crate::error::NegotiationError;
use crate::resource::{
    MediaBackend, PeerResource, RemoteStream, ResourceConfig, ResourceEvent, ResourceResult,
};

type Result<T> = std::result::Result<T, NegotiationError>;
type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    HaveLocalResource,
    Offering,
    Answering,
    Stable,
    Failed,
    Closed,
}

/// What happened to a remote candidate handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until the remote description is applied.
    Queued,
    /// Discarded; the negotiation state could not accept it.
    Dropped,
}

/// Notifications from the engine to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    PhaseChanged(NegotiationPhase),
    RemoteStreamAdded(RemoteStream),
    Failed(NegotiationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    CreateResource,
    StartAsInitiator,
    Renegotiate,
    ApplyRemoteOffer,
    ApplyRemoteAnswer,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::CreateResource => "create_resource",
            Operation::StartAsInitiator => "start_as_initiator",
            Operation::Renegotiate => "renegotiate",
            Operation::ApplyRemoteOffer => "apply_remote_offer",
            Operation::ApplyRemoteAnswer => "apply_remote_answer",
        }
    }

    fn required_role(self) -> Option<PeerRole> {
        match self {
            Operation::CreateResource => None,
            Operation::StartAsInitiator | Operation::Renegotiate | Operation::ApplyRemoteAnswer => {
                Some(PeerRole::Initiator)
            }
            Operation::ApplyRemoteOffer => Some(PeerRole::Responder),
        }
    }
}

/// Entry guard shared by every negotiating operation.
fn check_entry(role: PeerRole, phase: NegotiationPhase, op: Operation) -> Result<()> {
    use NegotiationPhase::*;

    if phase == Closed {
        return Err(NegotiationError::ClosedSession);
    }
    if let Some(required) = op.required_role() {
        if required != role {
            return Err(NegotiationError::RoleMismatch {
                operation: op.name(),
                role,
            });
        }
    }

    let allowed = match op {
        Operation::CreateResource => match phase {
            Idle => true,
            Failed => false,
            _ => return Err(NegotiationError::ResourceAlreadyExists),
        },
        Operation::StartAsInitiator => phase == HaveLocalResource,
        Operation::Renegotiate => phase == Stable,
        Operation::ApplyRemoteOffer => matches!(phase, Idle | HaveLocalResource | Stable),
        Operation::ApplyRemoteAnswer => phase == Offering,
    };
    if allowed {
        Ok(())
    } else {
        Err(NegotiationError::InvalidState {
            operation: op.name(),
            phase,
        })
    }
}

fn check_kind(description: &SessionDescription, expected: SdpKind) -> Result<()> {
    if description.kind == expected {
        Ok(())
    } else {
        Err(NegotiationError::UnexpectedDescription {
            expected,
            actual: description.kind,
        })
    }
}

enum Command {
    CreateResource(Reply<()>),
    StartAsInitiator(Reply<()>),
    Renegotiate(Reply<()>),
    ApplyRemoteOffer(SessionDescription, Reply<()>),
    ApplyRemoteAnswer(SessionDescription, Reply<()>),
    AddRemoteCandidate(IceCandidate, Reply<CandidateDisposition>),
    Teardown(oneshot::Sender<()>),
}

/// Handle to a running negotiation actor. Clones share the same session.
#[derive(Clone)]
pub struct NegotiationEngine {
    role: PeerRole,
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<NegotiationPhase>,
    cancel: CancellationToken,
}

impl NegotiationEngine {
    /// Spawn the actor on the current tokio runtime.
    ///
    /// Outgoing signaling messages are pushed to `outbound` already stamped
    /// with the local role; the caller owns encoding and transport.
    pub fn spawn(
        role: PeerRole,
        config: NegotiationConfig,
        backend: Arc<dyn MediaBackend>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (resource_tx, resource_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(NegotiationPhase::Idle);
        let cancel = CancellationToken::new();

        let actor = Negotiator {
            role,
            config,
            backend,
            outbound,
            events: event_tx,
            phase: phase_tx,
            cancel: cancel.clone(),
            resource_events: Some(resource_tx),
            resource_rx,
            deadline: None,
            state: NegotiationState::default(),
        };
        tokio::spawn(actor.run(command_rx));

        let engine = Self {
            role,
            commands: command_tx,
            phase: phase_rx,
            cancel,
        };
        (engine, event_rx)
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<NegotiationPhase> {
        self.phase.clone()
    }

    /// Resolve once the engine is in `target`. Fails with `ClosedSession` if
    /// the engine shuts down first.
    pub async fn wait_for_phase(&self, target: NegotiationPhase) -> Result<()> {
        let mut phase = self.phase.clone();
        loop {
            let current = *phase.borrow_and_update();
            if current == target {
                return Ok(());
            }
            if current == NegotiationPhase::Closed || phase.changed().await.is_err() {
                return if *phase.borrow() == target {
                    Ok(())
                } else {
                    Err(NegotiationError::ClosedSession)
                };
            }
        }
    }

    pub async fn create_resource(&self) -> Result<()> {
        self.request(Command::CreateResource).await
    }

    pub async fn start_as_initiator(&self) -> Result<()> {
        self.request(Command::StartAsInitiator).await
    }

    /// Start a new offer/answer round from `Stable` (initiator only).
    pub async fn renegotiate(&self) -> Result<()> {
        self.request(Command::Renegotiate).await
    }

    pub async fn apply_remote_offer(&self, description: SessionDescription) -> Result<()> {
        self.request(|reply| Command::ApplyRemoteOffer(description, reply))
            .await
    }

    pub async fn apply_remote_answer(&self, description: SessionDescription) -> Result<()> {
        self.request(|reply| Command::ApplyRemoteAnswer(description, reply))
            .await
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        self.request(|reply| Command::AddRemoteCandidate(candidate, reply))
            .await
    }

    /// Dispose the resource and close the session. Safe to call repeatedly.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Teardown(tx)).is_ok() {
            // Resolves once the actor has disposed the resource and exited.
            let _ = rx.await;
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| NegotiationError::ClosedSession)?;
        rx.await.map_err(|_| NegotiationError::ClosedSession)?
    }
}

#[derive(Default)]
struct NegotiationState {
    phase: NegotiationPhase,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    resource: Option<Arc<dyn PeerResource>>,
    pending_remote: VecDeque<IceCandidate>,
    held_local: Vec<IceCandidate>,
}

/// The actor side of a [`NegotiationEngine`].
struct Negotiator {
    role: PeerRole,
    config: NegotiationConfig,
    backend: Arc<dyn MediaBackend>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events: mpsc::UnboundedSender<EngineEvent>,
    phase: watch::Sender<NegotiationPhase>,
    cancel: CancellationToken,
    /// Handed to the backend when the resource is allocated.
    resource_events: Option<mpsc::UnboundedSender<ResourceEvent>>,
    resource_rx: mpsc::UnboundedReceiver<ResourceEvent>,
    deadline: Option<Instant>,
    state: NegotiationState,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Negotiator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = deadline_elapsed(deadline) => self.on_deadline(),
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                Some(event) = self.resource_rx.recv() => self.on_resource_event(event),
            }
        }
        self.close().await;
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::CreateResource(reply) => {
                let result = self.create_resource().await;
                let _ = reply.send(result);
            }
            Command::StartAsInitiator(reply) => {
                let result = self.start_as_initiator().await;
                let _ = reply.send(result);
            }
            Command::Renegotiate(reply) => {
                let result = self.renegotiate().await;
                let _ = reply.send(result);
            }
            Command::ApplyRemoteOffer(description, reply) => {
                let result = self.apply_remote_offer(description).await;
                let _ = reply.send(result);
            }
            Command::ApplyRemoteAnswer(description, reply) => {
                let result = self.apply_remote_answer(description).await;
                let _ = reply.send(result);
            }
            Command::AddRemoteCandidate(candidate, reply) => {
                let result = self.add_remote_candidate(candidate).await;
                let _ = reply.send(result);
            }
            Command::Teardown(reply) => {
                self.close().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn create_resource(&mut self) -> Result<()> {
        check_entry(self.role, self.state.phase, Operation::CreateResource)?;
        self.allocate().await
    }

    async fn start_as_initiator(&mut self) -> Result<()> {
        check_entry(self.role, self.state.phase, Operation::StartAsInitiator)?;
        self.arm_deadline();
        self.offer().await
    }

    async fn renegotiate(&mut self) -> Result<()> {
        check_entry(self.role, self.state.phase, Operation::Renegotiate)?;
        info!(role = %self.role, "renegotiating");
        self.begin_round();
        self.arm_deadline();
        self.offer().await
    }

    async fn apply_remote_offer(&mut self, description: SessionDescription) -> Result<()> {
        check_entry(self.role, self.state.phase, Operation::ApplyRemoteOffer)?;
        check_kind(&description, SdpKind::Offer)?;

        if self.state.phase == NegotiationPhase::Stable {
            info!(role = %self.role, "remote peer started a new negotiation round");
            self.begin_round();
        }
        if self.state.resource.is_none() {
            self.allocate().await?;
        }
        self.arm_deadline();
        let resource = self.resource()?;

        let result = self
            .step(
                NegotiationError::SetRemoteFailed,
                resource.set_remote_description(&description),
            )
            .await;
        self.settle(result)?;
        self.state.remote = Some(description);
        self.flush_pending_candidates(&resource).await;
        self.set_phase(NegotiationPhase::Answering);

        let result = self
            .step(NegotiationError::CreateAnswerFailed, resource.create_answer())
            .await;
        let answer = self.settle(result)?;
        self.apply_local(&resource, answer).await?;

        self.deadline = None;
        self.set_phase(NegotiationPhase::Stable);
        self.publish_local();
        Ok(())
    }

    async fn apply_remote_answer(&mut self, description: SessionDescription) -> Result<()> {
        check_entry(self.role, self.state.phase, Operation::ApplyRemoteAnswer)?;
        check_kind(&description, SdpKind::Answer)?;
        let resource = self.resource()?;

        let result = self
            .step(
                NegotiationError::SetRemoteFailed,
                resource.set_remote_description(&description),
            )
            .await;
        self.settle(result)?;
        self.state.remote = Some(description);

        self.deadline = None;
        self.set_phase(NegotiationPhase::Stable);
        self.flush_pending_candidates(&resource).await;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        match self.state.phase {
            NegotiationPhase::Closed => Err(NegotiationError::ClosedSession),
            phase @ (NegotiationPhase::Idle | NegotiationPhase::Failed) => {
                warn!(
                    role = %self.role,
                    ?phase,
                    mid = %candidate.media_id,
                    "dropped remote candidate: negotiation cannot accept it"
                );
                Ok(CandidateDisposition::Dropped)
            }
            _ if self.state.remote.is_some() => {
                let resource = self.resource()?;
                Ok(self.apply_remote_candidate(&resource, candidate).await)
            }
            _ => {
                self.state.pending_remote.push_back(candidate);
                debug!(
                    role = %self.role,
                    queued = self.state.pending_remote.len(),
                    "queued remote candidate until remote description is applied"
                );
                Ok(CandidateDisposition::Queued)
            }
        }
    }

    async fn allocate(&mut self) -> Result<()> {
        let Some(events) = self.resource_events.take() else {
            return Err(NegotiationError::ResourceAlreadyExists);
        };
        let config = ResourceConfig {
            ice_servers: self.config.ice_servers.clone(),
            local_media: self.config.local_media,
        };

        let backend = Arc::clone(&self.backend);
        let result = self
            .step(
                NegotiationError::CreateResourceFailed,
                backend.create_resource(&config, events),
            )
            .await;
        let resource = self.settle(result)?;
        self.state.resource = Some(resource);
        info!(role = %self.role, ice_servers = ?config.ice_servers, "peer resource created");
        self.set_phase(NegotiationPhase::HaveLocalResource);
        Ok(())
    }

    async fn offer(&mut self) -> Result<()> {
        let resource = self.resource()?;
        let result = self
            .step(NegotiationError::CreateDescriptionFailed, resource.create_offer())
            .await;
        let offer = self.settle(result)?;
        self.apply_local(&resource, offer).await?;
        self.set_phase(NegotiationPhase::Offering);
        self.publish_local();
        Ok(())
    }

    async fn apply_local(
        &mut self,
        resource: &Arc<dyn PeerResource>,
        description: SessionDescription,
    ) -> Result<()> {
        if self.state.local.is_some() {
            return Err(NegotiationError::InvalidState {
                operation: "set_local_description",
                phase: self.state.phase,
            });
        }
        let result = self
            .step(
                NegotiationError::SetLocalFailed,
                resource.set_local_description(&description),
            )
            .await;
        self.settle(result)?;
        self.state.local = Some(description);
        Ok(())
    }

    /// Send the local description, then any candidates gathered before it
    /// was applied.
    fn publish_local(&mut self) {
        let Some(local) = self.state.local.clone() else {
            return;
        };
        info!(role = %self.role, kind = local.kind.as_str(), "sending local description");
        self.emit(SignalingMessage::sdp(local, self.role));
        for candidate in std::mem::take(&mut self.state.held_local) {
            self.emit(SignalingMessage::trickle(candidate, self.role));
        }
    }

    async fn flush_pending_candidates(&mut self, resource: &Arc<dyn PeerResource>) {
        if !self.state.pending_remote.is_empty() {
            debug!(
                role = %self.role,
                count = self.state.pending_remote.len(),
                "applying queued remote candidates"
            );
        }
        while let Some(candidate) = self.state.pending_remote.pop_front() {
            self.apply_remote_candidate(resource, candidate).await;
        }
    }

    async fn apply_remote_candidate(
        &self,
        resource: &Arc<dyn PeerResource>,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        match resource.add_candidate(&candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                warn!(role = %self.role, mid = %candidate.media_id, "remote candidate rejected: {}", e);
                CandidateDisposition::Dropped
            }
        }
    }

    fn on_resource_event(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::CandidateGathered(candidate) => {
                if self.state.local.is_some() {
                    debug!(role = %self.role, mid = %candidate.media_id, "trickling local candidate");
                    self.emit(SignalingMessage::trickle(candidate, self.role));
                } else {
                    self.state.held_local.push(candidate);
                }
            }
            ResourceEvent::RemoteStreamAdded(stream) => {
                info!(role = %self.role, stream = %stream.stream_id, kind = %stream.kind, "remote stream added");
                let _ = self.events.send(EngineEvent::RemoteStreamAdded(stream));
            }
        }
    }

    fn on_deadline(&mut self) {
        self.deadline = None;
        if matches!(
            self.state.phase,
            NegotiationPhase::Stable | NegotiationPhase::Failed | NegotiationPhase::Closed
        ) {
            return;
        }
        let timeout = self.config.negotiation_timeout.unwrap_or_default();
        self.fail(NegotiationError::NegotiationTimeout(timeout));
    }

    /// Run one resource operation, giving way to teardown and the deadline.
    /// Candidates gathered meanwhile are held or trickled as usual.
    async fn step<T, F>(&mut self, stage: fn(String) -> NegotiationError, operation: F) -> Result<T>
    where
        F: Future<Output = ResourceResult<T>>,
    {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(NegotiationError::ClosedSession),
                _ = deadline_elapsed(self.deadline) => {
                    return Err(NegotiationError::NegotiationTimeout(
                        self.config.negotiation_timeout.unwrap_or_default(),
                    ))
                }
                result = &mut operation => return result.map_err(|e| stage(e.0)),
                Some(event) = self.resource_rx.recv() => self.on_resource_event(event),
            }
        }
    }

    /// Apply the failure policy to a step result.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, error: NegotiationError) -> NegotiationError {
        if !error.is_fatal() {
            return error;
        }
        error!(role = %self.role, "negotiation failed: {}", error);
        self.deadline = None;
        self.set_phase(NegotiationPhase::Failed);
        let _ = self.events.send(EngineEvent::Failed(error.clone()));
        error
    }

    fn begin_round(&mut self) {
        self.state.local = None;
        self.state.remote = None;
        self.state.held_local.clear();
    }

    fn arm_deadline(&mut self) {
        self.deadline = self
            .config
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    fn resource(&self) -> Result<Arc<dyn PeerResource>> {
        self.state
            .resource
            .clone()
            .ok_or(NegotiationError::InvalidState {
                operation: "resource",
                phase: self.state.phase,
            })
    }

    fn emit(&self, message: SignalingMessage) {
        if self.outbound.send(message).is_err() {
            warn!(role = %self.role, "outbound signaling queue is gone; message dropped");
        }
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        if self.state.phase == phase {
            return;
        }
        debug!(role = %self.role, from = ?self.state.phase, to = ?phase, "negotiation phase");
        self.state.phase = phase;
        self.phase.send_replace(phase);
        let _ = self.events.send(EngineEvent::PhaseChanged(phase));
    }

    async fn close(&mut self) {
        if self.state.phase == NegotiationPhase::Closed {
            return;
        }
        self.deadline = None;
        self.state.pending_remote.clear();
        if let Some(resource) = self.state.resource.take() {
            resource.dispose().await;
        }
        self.set_phase(NegotiationPhase::Closed);
        info!(role = %self.role, "negotiation session closed");
    }
}
