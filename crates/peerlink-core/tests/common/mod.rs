//! Scripted in-memory media backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_common::{IceCandidate, SessionDescription, SignalingMessage};
use peerlink_core::{
    MediaBackend, PeerResource, RemoteStream, ResourceConfig, ResourceError, ResourceEvent,
    ResourceResult,
};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CreateResource,
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
}

/// Stages that fail immediately, never complete, or wait for
/// [`Probe::release`].
#[derive(Default)]
pub struct Script {
    pub fail: HashSet<Stage>,
    pub hang: HashSet<Stage>,
    pub gate: HashSet<Stage>,
}

impl Script {
    pub fn failing(stage: Stage) -> Self {
        let mut script = Self::default();
        script.fail.insert(stage);
        script
    }

    pub fn hanging(stage: Stage) -> Self {
        let mut script = Self::default();
        script.hang.insert(stage);
        script
    }

    pub fn gated(stage: Stage) -> Self {
        let mut script = Self::default();
        script.gate.insert(stage);
        script
    }
}

/// What the scripted resource observed.
#[derive(Default)]
pub struct Probe {
    pub applied: Mutex<Vec<IceCandidate>>,
    pub local: Mutex<Vec<SessionDescription>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub created: AtomicUsize,
    pub disposed: AtomicUsize,
    pub events: Mutex<Option<mpsc::UnboundedSender<ResourceEvent>>>,
    /// Notified when a hanging or gated stage starts waiting.
    pub hung: Notify,
    gate: Notify,
}

impl Probe {
    /// Let a gated stage complete.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn gather(&self, candidate: IceCandidate) {
        let events = self.events.lock();
        let tx = events.as_ref().expect("resource not created yet");
        tx.send(ResourceEvent::CandidateGathered(candidate))
            .expect("engine dropped resource events");
    }

    pub fn add_remote_stream(&self, stream: RemoteStream) {
        let events = self.events.lock();
        let tx = events.as_ref().expect("resource not created yet");
        tx.send(ResourceEvent::RemoteStreamAdded(stream))
            .expect("engine dropped resource events");
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    script: Arc<Script>,
    probe: Arc<Probe>,
    name: &'static str,
}

impl ScriptedBackend {
    pub fn new(name: &'static str, script: Script) -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let backend = Arc::new(Self {
            script: Arc::new(script),
            probe: Arc::clone(&probe),
            name,
        });
        (backend, probe)
    }
}

async fn run_stage(script: &Script, probe: &Probe, stage: Stage) -> ResourceResult<()> {
    if script.hang.contains(&stage) {
        probe.hung.notify_one();
        std::future::pending::<()>().await;
    }
    if script.gate.contains(&stage) {
        probe.hung.notify_one();
        probe.gate.notified().await;
    }
    if script.fail.contains(&stage) {
        return Err(ResourceError::new(format!("{stage:?} scripted failure")));
    }
    Ok(())
}

#[async_trait]
impl MediaBackend for ScriptedBackend {
    async fn create_resource(
        &self,
        _config: &ResourceConfig,
        events: mpsc::UnboundedSender<ResourceEvent>,
    ) -> ResourceResult<Arc<dyn PeerResource>> {
        run_stage(&self.script, &self.probe, Stage::CreateResource).await?;
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        *self.probe.events.lock() = Some(events);
        Ok(Arc::new(ScriptedResource {
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
            name: self.name,
        }))
    }
}

struct ScriptedResource {
    script: Arc<Script>,
    probe: Arc<Probe>,
    name: &'static str,
}

#[async_trait]
impl PeerResource for ScriptedResource {
    async fn create_offer(&self) -> ResourceResult<SessionDescription> {
        run_stage(&self.script, &self.probe, Stage::CreateOffer).await?;
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_answer(&self) -> ResourceResult<SessionDescription> {
        run_stage(&self.script, &self.probe, Stage::CreateAnswer).await?;
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> ResourceResult<()> {
        run_stage(&self.script, &self.probe, Stage::SetLocal).await?;
        self.probe.local.lock().push(description.clone());
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> ResourceResult<()> {
        run_stage(&self.script, &self.probe, Stage::SetRemote).await?;
        self.probe.remote.lock().push(description.clone());
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> ResourceResult<()> {
        self.probe.applied.lock().push(candidate.clone());
        Ok(())
    }

    async fn dispose(&self) {
        self.probe.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        media_line_index: 0,
        media_id: "0".to_string(),
        candidate: tag.to_string(),
    }
}

/// Next outbound signaling message, failing the test after a few seconds.
pub async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound queue closed")
}
