//! The P2P engine.
//!
//! [`P2pEngine`] is a cheap clonable handle. All state lives in a single
//! supervisor task; the handle sends it [`EngineCommand`]s and observes its
//! state, ready-peer count and profile through `watch` channels.

pub mod commands;
pub mod dispatch;
pub mod requests;
mod supervisor;
pub mod uploads;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use swarmfetch_core::{ContentHash, SwarmTopic};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use commands::{
    DispatchRefusal, EngineCommand, EngineSnapshot, EngineState, PeerSnapshot, RequestTicket,
    TransferEvent,
};
pub use dispatch::P2pStream;

use crate::config::EngineConfig;
use crate::error::{P2pError, P2pResult};
use crate::peer::PeerId;
use crate::store::ContentStore;
use crate::system::monitor::SAMPLE_INTERVAL;
use crate::system::{
    InterfaceProbe, NodeAdapter, Profile, ResourceMonitor, SysinfoProbe, SystemInterfaceProbe,
};
use crate::traffic::TrafficState;
use supervisor::{Publishers, Supervisor};

/// Collaborators the engine is built from.
pub struct EngineContext {
    pub store: Arc<dyn ContentStore>,
    pub traffic: Arc<TrafficState>,
    pub adapter: NodeAdapter,
    pub resources: ResourceMonitor,
    pub interfaces: Arc<dyn InterfaceProbe>,
    /// Key sealing the peer cache.
    pub cache_key: [u8; 32],
    pub topic: SwarmTopic,
}

impl EngineContext {
    /// Production defaults: detected hardware tier, sysinfo sampling and
    /// the route-based interface probe.
    pub fn new(store: Arc<dyn ContentStore>, cache_key: [u8; 32]) -> Self {
        Self {
            store,
            traffic: TrafficState::new(),
            adapter: NodeAdapter::detect(),
            resources: ResourceMonitor::spawn(SysinfoProbe::new(), SAMPLE_INTERVAL),
            interfaces: Arc::new(SystemInterfaceProbe),
            cache_key,
            topic: SwarmTopic::fixed(),
        }
    }

    pub fn with_traffic(mut self, traffic: Arc<TrafficState>) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn with_adapter(mut self, adapter: NodeAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_resources(mut self, resources: ResourceMonitor) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceProbe>) -> Self {
        self.interfaces = interfaces;
        self
    }
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct P2pEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<EngineState>,
    peers: watch::Receiver<usize>,
    profile: watch::Receiver<Profile>,
    traffic: Arc<TrafficState>,
}

impl P2pEngine {
    /// Spawn the supervisor task. The engine starts in
    /// [`EngineState::Stopped`]; call [`start`](Self::start) to join the swarm.
    ///
    /// The task exits once every handle is dropped.
    pub fn spawn(config: EngineConfig, ctx: EngineContext) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(EngineState::Stopped);
        let (peers_tx, peers) = watch::channel(0);
        let (profile_tx, profile) = watch::channel(ctx.adapter.current());
        let traffic = ctx.traffic.clone();

        let supervisor = Supervisor::new(
            config,
            ctx,
            commands_rx,
            Publishers {
                state: state_tx,
                peers: peers_tx,
                profile: profile_tx,
            },
        );
        let handle = tokio::spawn(supervisor.run());

        (
            Self {
                commands: commands_tx,
                state,
                peers,
                profile,
                traffic,
            },
            handle,
        )
    }

    fn send(&self, command: EngineCommand) -> P2pResult<()> {
        self.commands
            .send(command)
            .map_err(|_| P2pError::EngineStopped)
    }

    /// Join the swarm. Idempotent.
    pub async fn start(&self) -> P2pResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Start { reply })?;
        rx.await.map_err(|_| P2pError::EngineStopped)?
    }

    /// Leave the swarm, dropping every peer. Idempotent.
    pub async fn stop(&self) -> P2pResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Stop { reply })?;
        rx.await.map_err(|_| P2pError::EngineStopped)
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Peers that completed the handshake.
    pub fn peer_count(&self) -> usize {
        *self.peers.borrow()
    }

    pub fn profile(&self) -> Profile {
        *self.profile.borrow()
    }

    pub fn traffic(&self) -> Arc<TrafficState> {
        self.traffic.clone()
    }

    /// Dial `addr` now and keep it as a candidate.
    pub fn add_peer(&self, addr: SocketAddr) -> P2pResult<()> {
        self.send(EngineCommand::AddPeer(addr))
    }

    /// Raise the advertised weight by one.
    pub fn boost_weight(&self) -> P2pResult<()> {
        self.send(EngineCommand::BoostWeight)
    }

    /// Lower the advertised weight by one.
    pub fn penalize_weight(&self) -> P2pResult<()> {
        self.send(EngineCommand::PenalizeWeight)
    }

    pub fn set_upload_enabled(&self, enabled: bool) -> P2pResult<()> {
        self.send(EngineCommand::SetUploadEnabled(enabled))
    }

    pub fn set_local_upload_enabled(&self, enabled: bool) -> P2pResult<()> {
        self.send(EngineCommand::SetLocalUploadEnabled(enabled))
    }

    pub async fn snapshot(&self) -> P2pResult<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { reply })?;
        rx.await.map_err(|_| P2pError::EngineStopped)
    }

    /// Wait until at least `count` peers are ready. Returns `false` on timeout.
    pub async fn wait_for_peers(&self, count: usize, wait: Duration) -> bool {
        let mut peers = self.peers.clone();
        tokio::time::timeout(wait, peers.wait_for(|n| *n >= count))
            .await
            .map_or(false, |r| r.is_ok())
    }

    pub(crate) fn cancel_request(&self, request_id: u32) {
        let _ = self.send(EngineCommand::CancelRequest { request_id });
    }

    pub(crate) async fn begin_request(
        &self,
        hash: ContentHash,
        size: u64,
        exclude: HashSet<PeerId>,
    ) -> Result<RequestTicket, DispatchRefusal> {
        let (reply, rx) = oneshot::channel();
        let command = EngineCommand::BeginRequest {
            hash,
            size,
            exclude,
            reply,
        };
        if self.send(command).is_err() {
            return Err(DispatchRefusal::NotRunning);
        }
        rx.await.unwrap_or(Err(DispatchRefusal::NotRunning))
    }
}

impl std::fmt::Debug for P2pEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pEngine")
            .field("state", &self.state())
            .field("peers", &self.peer_count())
            .finish()
    }
}
