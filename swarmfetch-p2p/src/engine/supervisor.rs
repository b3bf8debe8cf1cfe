//! The engine actor.
//!
//! One task owns every piece of mutable engine state: the peer registry,
//! request table, upload book, usage tracker, reputation, circuit breaker,
//! health monitor and node adapter. Handles talk to it with
//! [`EngineCommand`]s, connections with [`PeerEvent`]s, and helper tasks
//! (accept loop, dialers, LAN beacon) with internal events. Timers drive
//! request expiry, dialling, health checks, network checks and periodic
//! maintenance.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use swarmfetch_core::{ContentHash, SwarmTopic};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};

use crate::config::{
    EngineConfig, DIAL_INTERVAL, HEALTH_CHECK_INTERVAL, NETWORK_CHECK_INTERVAL,
    NETWORK_SETTLE_DELAY, PANIC_RESTART_DELAY, SAVE_INTERVAL, SMALL_ASSET_THRESHOLD,
    STRIKE_DECAY_INTERVAL,
};
use crate::discovery::{
    unix_now, write_atomic, BeaconConfig, CandidateSource, JoinOptions, LanBeacon, PeerCache,
    PeerScope, PersistedPeerRecord, PersistenceWriter, RoutingTable,
};
use crate::engine::commands::{
    DispatchRefusal, EngineCommand, EngineSnapshot, EngineState, PeerSnapshot, RequestTicket,
};
use crate::engine::requests::{DataOutcome, PendingRequest, RequestTable};
use crate::engine::uploads::UploadBook;
use crate::engine::EngineContext;
use crate::error::P2pResult;
use crate::manager::{connect_to_peer, ConnectResult, InboundListener, PeerRegistry};
use crate::peer::{
    spawn_peer_connection, AdmissionRequest, ConnectionDirection, HandlerContext, Peer,
    PeerCommand, PeerEvent, PeerId, PeerIdentity, UploadGrant, UploadOutcome, UploadReport,
    SERVE_SLOT_MARGIN,
};
use crate::policy::health::BASELINE_UPLOAD_CEILING;
use crate::policy::scoring::best;
use crate::policy::{
    download_concurrency_limit, score, upload_ceiling, CircuitBreaker, HealthMonitor,
    HealthVerdict, Reputation, StrikeOutcome,
};
use crate::protocol::{reasons, Frame, Hello, MessageKind, RequestPayload};
use crate::store::ContentStore;
use crate::system::{is_lan_peer, InterfaceProbe, NodeAdapter, Profile, ResourceMonitor};
use crate::throttle::RateLimiter;
use crate::traffic::TrafficState;
use crate::usage::{cost_for, UsageTracker};

/// CPU usage at which the advertised weight is lowered.
const CPU_STRESS_PERCENT: f32 = 90.0;

/// CPU usage below which a lowered weight recovers.
const CPU_CALM_PERCENT: f32 = 50.0;

/// Pause after an accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events from helper tasks.
#[derive(Debug)]
pub(crate) enum InternalEvent {
    Inbound(TcpStream, SocketAddr),
    Dialled(ConnectResult),
}

/// Channels the supervisor publishes on.
pub(crate) struct Publishers {
    pub state: watch::Sender<EngineState>,
    pub peers: watch::Sender<usize>,
    pub profile: watch::Sender<Profile>,
}

pub(crate) struct Supervisor {
    config: EngineConfig,
    store: Arc<dyn ContentStore>,
    traffic: Arc<TrafficState>,
    adapter: NodeAdapter,
    resources: ResourceMonitor,
    interfaces: Arc<dyn InterfaceProbe>,
    topic: SwarmTopic,
    cache_key: [u8; 32],

    commands: mpsc::UnboundedReceiver<EngineCommand>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal: mpsc::UnboundedReceiver<InternalEvent>,
    discovered_tx: mpsc::UnboundedSender<SocketAddr>,
    discovered: mpsc::UnboundedReceiver<SocketAddr>,
    publish: Publishers,

    registry: PeerRegistry,
    requests: RequestTable,
    uploads: UploadBook,
    usage: UsageTracker,
    reputation: Reputation,
    breaker: CircuitBreaker,
    health: HealthMonitor,
    limiter: Arc<RateLimiter>,
    routing: RoutingTable,
    cache: PeerCache,
    writer: Option<PersistenceWriter>,

    joined: Option<JoinOptions>,
    listen_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    beacon: Option<LanBeacon>,
    local_ipv4: Option<Ipv4Addr>,
    fingerprint: Option<String>,
    restart_at: Option<Instant>,
}

impl Supervisor {
    pub(crate) fn new(
        config: EngineConfig,
        ctx: EngineContext,
        commands: mpsc::UnboundedReceiver<EngineCommand>,
        publish: Publishers,
    ) -> Self {
        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (discovered_tx, discovered) = mpsc::unbounded_channel();

        Self {
            requests: RequestTable::new(config.size_tolerance),
            uploads: UploadBook::new(config.max_uploads, config.max_uploads_per_ip),
            cache: PeerCache::empty(config.peers_file.clone(), ctx.cache_key),
            config,
            store: ctx.store,
            traffic: ctx.traffic,
            adapter: ctx.adapter,
            resources: ctx.resources,
            interfaces: ctx.interfaces,
            topic: ctx.topic,
            cache_key: ctx.cache_key,
            commands,
            peer_events_tx,
            peer_events,
            internal_tx,
            internal,
            discovered_tx,
            discovered,
            publish,
            registry: PeerRegistry::new(),
            usage: UsageTracker::default(),
            reputation: Reputation::default(),
            breaker: CircuitBreaker::default(),
            health: HealthMonitor::default(),
            limiter: Arc::new(RateLimiter::new(BASELINE_UPLOAD_CEILING)),
            routing: RoutingTable::new(),
            writer: None,
            joined: None,
            listen_addr: None,
            accept_task: None,
            beacon: None,
            local_ipv4: None,
            fingerprint: None,
            restart_at: None,
        }
    }

    /// Run until every engine handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut housekeeping = interval(Duration::from_secs(1));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut dial_timer = interval(DIAL_INTERVAL);
        let start = tokio::time::Instant::now();
        let mut health_timer = interval_at(start + HEALTH_CHECK_INTERVAL, HEALTH_CHECK_INTERVAL);
        let mut network_timer = interval_at(start + NETWORK_CHECK_INTERVAL, NETWORK_CHECK_INTERVAL);
        let mut decay_timer = interval_at(start + STRIKE_DECAY_INTERVAL, STRIKE_DECAY_INTERVAL);
        let mut save_timer = interval_at(start + SAVE_INTERVAL, SAVE_INTERVAL);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(event) = self.peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }

                Some(event) = self.internal.recv() => {
                    self.handle_internal(event);
                }

                Some(addr) = self.discovered.recv() => {
                    if self.routing.add(addr, CandidateSource::Beacon) && self.is_running() {
                        tracing::debug!(addr = %addr, "Discovered LAN peer");
                        self.dial(addr);
                    }
                }

                _ = housekeeping.tick() => self.housekeeping().await,
                _ = dial_timer.tick() => self.dial_candidates(),
                _ = health_timer.tick() => self.health_check().await,
                _ = network_timer.tick() => self.check_network().await,

                _ = decay_timer.tick() => {
                    let now = Instant::now();
                    self.reputation.decay(now);
                    let purged = self.usage.purge_idle(now);
                    if purged > 0 {
                        tracing::debug!(purged, "Purged idle usage entries");
                    }
                }

                _ = save_timer.tick() => self.queue_save(),
            }
        }

        tracing::info!("P2P engine shutting down");
        self.stop().await;
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    fn state(&self) -> EngineState {
        *self.publish.state.borrow()
    }

    fn set_state(&self, state: EngineState) {
        tracing::debug!(state = %state, "Engine state");
        self.publish.state.send_replace(state);
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    fn publish_profile(&self) {
        self.publish.profile.send_replace(self.adapter.current());
    }

    fn publish_peer_count(&self) {
        self.publish.peers.send_replace(self.registry.ready_count());
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            EngineCommand::Stop { reply } => {
                self.restart_at = None;
                self.stop().await;
                let _ = reply.send(());
            }
            EngineCommand::BeginRequest {
                hash,
                size,
                exclude,
                reply,
            } => {
                let result = self.begin_request(hash, size, &exclude);
                if let Err(ticket) = reply.send(result) {
                    // Requester gave up while we were assigning
                    if let Ok(ticket) = ticket {
                        self.cancel_request(ticket.request_id);
                    }
                }
            }
            EngineCommand::CancelRequest { request_id } => self.cancel_request(request_id),
            EngineCommand::AddPeer(addr) => {
                self.routing.add(addr, CandidateSource::Manual);
                if self.is_running() {
                    self.dial(addr);
                }
            }
            EngineCommand::BoostWeight => {
                let profile = self.adapter.boost();
                tracing::debug!(weight = profile.weight, "Weight boosted");
                self.publish_profile();
                self.refresh_join().await;
            }
            EngineCommand::PenalizeWeight => {
                let profile = self.adapter.penalize();
                tracing::debug!(weight = profile.weight, "Weight penalized");
                self.publish_profile();
                self.refresh_join().await;
            }
            EngineCommand::SetUploadEnabled(enabled) => {
                self.config.upload_enabled = enabled;
                tracing::info!(enabled, "Internet uploads toggled");
                self.refresh_join().await;
            }
            EngineCommand::SetLocalUploadEnabled(enabled) => {
                self.config.local_upload_enabled = enabled;
                tracing::info!(enabled, "LAN uploads toggled");
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Whether this node should accept peers and announce itself.
    fn should_announce(&self, now: Instant) -> bool {
        let profile = self.adapter.current();
        !profile.passive
            && !profile.is_critical()
            && (self.config.upload_enabled || self.config.local_optimization)
            && !self.health.is_isolated(now)
    }

    async fn start(&mut self) -> P2pResult<()> {
        match self.state() {
            EngineState::Running | EngineState::Starting => return Ok(()),
            _ => {}
        }
        self.set_state(EngineState::Starting);
        self.restart_at = None;

        self.local_ipv4 = self.interfaces.primary_ipv4();
        self.fingerprint = self.interfaces.fingerprint();

        self.cache = PeerCache::load(self.config.peers_file.clone(), self.cache_key).await;
        for addr in self.cache.addresses() {
            self.routing.add(addr, CandidateSource::Cache);
        }
        for addr in self.config.bootstrap_peers.clone() {
            self.routing.add(addr, CandidateSource::Bootstrap);
        }
        if self.writer.is_none() {
            self.writer = Some(PersistenceWriter::spawn(self.config.peers_file.clone()));
        }

        let options = JoinOptions {
            client: true,
            server: self.should_announce(Instant::now()),
        };
        if let Err(e) = self.join(options).await {
            tracing::warn!(error = %e, "Failed to join swarm");
            self.set_state(EngineState::Stopped);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        tracing::info!(
            topic = %self.topic,
            server = options.server,
            listen = ?self.listen_addr,
            candidates = self.routing.len(),
            "P2P engine started"
        );
        self.dial_candidates();
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        self.set_state(EngineState::Stopping);

        self.remember_connected();
        self.flush_cache().await;

        self.leave().await;
        self.requests.fail_all();
        let dropped = self.registry.disconnect_all();
        self.uploads.clear();
        self.publish_peer_count();

        self.set_state(EngineState::Stopped);
        tracing::info!(peers = dropped.len(), "P2P engine stopped");
    }

    /// Bind the listener and beacon for `options`, replacing previous ones.
    async fn join(&mut self, options: JoinOptions) -> P2pResult<()> {
        self.leave().await;

        if options.server {
            let listener = InboundListener::bind(self.config.listen_addr).await?;
            let addr = listener.local_addr()?;
            self.listen_addr = Some(addr);
            self.routing.set_own_addr(Some(addr));
            self.accept_task = Some(tokio::spawn(accept_loop(listener, self.internal_tx.clone())));
        }

        if let Some(port) = self.config.beacon_port {
            let announce = self.listen_addr.map(|addr| addr.port());
            let config = BeaconConfig::broadcast(port, self.topic, announce);
            match LanBeacon::spawn(config, self.discovered_tx.clone()).await {
                Ok(beacon) => self.beacon = Some(beacon),
                Err(e) => tracing::warn!(port, error = %e, "LAN beacon unavailable"),
            }
        }

        self.joined = Some(options);
        Ok(())
    }

    async fn leave(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(beacon) = self.beacon.take() {
            beacon.stop().await;
        }
        self.listen_addr = None;
        self.routing.set_own_addr(None);
        self.joined = None;
    }

    /// Re-join if the announce decision changed.
    async fn refresh_join(&mut self) {
        if !self.is_running() {
            return;
        }
        let options = JoinOptions {
            client: true,
            server: self.should_announce(Instant::now()),
        };
        if self.joined == Some(options) {
            return;
        }
        tracing::info!(server = options.server, "Re-joining swarm");
        if let Err(e) = self.join(options).await {
            tracing::warn!(error = %e, "Failed to re-join swarm, continuing client-only");
            self.joined = Some(JoinOptions::client_only());
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Inbound(stream, addr) => {
                if !self.is_running() {
                    return;
                }
                let identity = PeerIdentity::from_ip(addr.ip());
                if self.reputation.is_blacklisted(&identity, Instant::now()) {
                    tracing::debug!(addr = %addr, identity = %identity, "Rejecting inbound: blacklisted");
                    return;
                }
                if self.registry.len() >= 2 * self.adapter.current().max_peers {
                    tracing::debug!(addr = %addr, "Rejecting inbound: no slots");
                    return;
                }
                self.attach(stream, addr, ConnectionDirection::Inbound);
            }
            InternalEvent::Dialled(ConnectResult::Connected(addr, stream)) => {
                self.registry.stop_connecting(&addr);
                if !self.is_running() {
                    return;
                }
                let identity = PeerIdentity::from_ip(addr.ip());
                if self.reputation.is_blacklisted(&identity, Instant::now()) {
                    tracing::debug!(addr = %addr, "Dropping outbound: blacklisted");
                    return;
                }
                self.routing.mark_connected(&addr);
                self.attach(stream, addr, ConnectionDirection::Outbound);
            }
            InternalEvent::Dialled(ConnectResult::Failed(addr, e)) => {
                self.registry.stop_connecting(&addr);
                self.routing.mark_failed(&addr, Instant::now());
                tracing::debug!(addr = %addr, error = %e, "Outbound connection failed");
            }
        }
    }

    fn handler_context(&self) -> HandlerContext {
        let profile = self.adapter.current();
        HandlerContext {
            events: self.peer_events_tx.clone(),
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            hello: Hello::new(profile.weight, true),
            buffer_size: profile.buffer_size,
            idle_timeout: self.config.idle_timeout,
            keepalive_interval: self.config.keepalive_interval,
            batch_charges_usage: self.config.batch_charges_usage,
            max_serving: self.config.max_uploads_per_ip + SERVE_SLOT_MARGIN,
        }
    }

    fn attach(&mut self, stream: TcpStream, addr: SocketAddr, direction: ConnectionDirection) {
        let peer_id = self.registry.next_peer_id();
        let lan = is_lan_peer(addr.ip(), self.local_ipv4);
        let mut peer = Peer::new(peer_id, addr, direction, lan);
        peer.strikes = self.reputation.strikes(&peer.identity);

        let (commands, _handle) = spawn_peer_connection(peer_id, stream, self.handler_context());
        tracing::debug!(peer = %peer_id, addr = %addr, direction = %direction, lan, "Peer connected");
        self.registry.add(peer, commands);
    }

    fn dial(&mut self, addr: SocketAddr) {
        let capacity = self.adapter.current().max_peers;
        if !self.registry.should_dial(&addr, capacity) {
            return;
        }
        self.registry.start_connecting(addr);
        let events = self.internal_tx.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let result = connect_to_peer(addr, timeout).await;
            let _ = events.send(InternalEvent::Dialled(result));
        });
    }

    fn dial_candidates(&mut self) {
        if !self.is_running() || !self.joined.map_or(false, |j| j.client) {
            return;
        }
        let capacity = self.adapter.current().max_peers;
        let open = capacity.saturating_sub(self.registry.len() + self.registry.connecting_count());
        if open == 0 {
            return;
        }
        let registry = &self.registry;
        let due = self
            .routing
            .due(Instant::now(), open, |addr| registry.should_dial(addr, capacity));
        for addr in due {
            self.dial(addr);
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Hello { peer_id, hello } => {
                if let Some(peer) = self.registry.get_mut(&peer_id) {
                    peer.complete_hello(hello);
                    tracing::debug!(peer = %peer, "Peer ready");
                }
                self.publish_peer_count();
            }
            PeerEvent::Rtt { peer_id, rtt } => {
                if let Some(peer) = self.registry.get_mut(&peer_id) {
                    peer.rtt = Some(rtt);
                }
            }
            PeerEvent::Transfer { peer_id, frame } => self.handle_transfer(peer_id, frame).await,
            PeerEvent::Admit(request) => self.admit(request),
            PeerEvent::UploadProgress {
                upload_id, bytes, ..
            } => self.uploads.progress(upload_id, bytes),
            PeerEvent::UploadFinished(report) => self.finish_upload(report),
            PeerEvent::Violation { peer_id, reason } => self.strike(peer_id, &reason).await,
            PeerEvent::Disconnected { peer_id, reason } => {
                let Some(peer) = self.registry.remove(&peer_id) else {
                    return;
                };
                let failed = self.requests.fail_peer(peer_id, &reason);
                self.remember(&peer, Instant::now());
                tracing::debug!(peer = %peer_id, reason = %reason, failed, "Peer disconnected");
                self.publish_peer_count();
            }
        }
    }

    async fn handle_transfer(&mut self, peer_id: PeerId, frame: Frame) {
        let now = Instant::now();
        match frame.kind {
            MessageKind::Data => {
                let len = frame.payload.len() as u64;
                match self.requests.on_data(peer_id, frame.request_id, frame.payload, now) {
                    DataOutcome::Accepted => {
                        if let Some(peer) = self.registry.get_mut(&peer_id) {
                            peer.bytes_recv += len;
                        }
                        self.traffic.record_download(len);
                    }
                    DataOutcome::Ignored => {
                        tracing::trace!(peer = %peer_id, request_id = frame.request_id, "Dropping stray data");
                    }
                    DataOutcome::Abandoned(peer) => self.release_request_slot(peer),
                    DataOutcome::Overflow(peer) => {
                        self.release_request_slot(peer);
                        self.strike(peer, "transfer exceeded size limit").await;
                    }
                }
            }
            MessageKind::End => {
                if let Some(finished) = self.requests.on_end(peer_id, frame.request_id, now) {
                    self.release_request_slot(peer_id);
                    if finished.complete {
                        if let Some(peer) = self.registry.get_mut(&peer_id) {
                            peer.record_transfer(finished.bytes, finished.elapsed, now);
                        }
                        tracing::debug!(
                            peer = %peer_id,
                            bytes = finished.bytes,
                            elapsed_ms = finished.elapsed.as_millis() as u64,
                            "Download complete"
                        );
                    }
                }
            }
            MessageKind::Error => {
                let reason = frame.reason();
                if self.requests.on_error(peer_id, frame.request_id, reason.clone()).is_some() {
                    self.release_request_slot(peer_id);
                    tracing::debug!(peer = %peer_id, reason = %reason, "Peer refused request");
                }
            }
            _ => {}
        }
    }

    fn release_request_slot(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.registry.get_mut(&peer_id) {
            peer.active_requests = peer.active_requests.saturating_sub(1);
        }
    }

    fn cancel_request(&mut self, request_id: u32) {
        if let Some(request) = self.requests.cancel(request_id) {
            tracing::trace!(request_id, peer = %request.peer_id, "Request cancelled");
            self.release_request_slot(request.peer_id);
        }
    }

    fn begin_request(
        &mut self,
        hash: ContentHash,
        size: u64,
        exclude: &HashSet<PeerId>,
    ) -> Result<RequestTicket, DispatchRefusal> {
        if !self.is_running() {
            return Err(DispatchRefusal::NotRunning);
        }
        let now = Instant::now();

        let candidates: Vec<(PeerId, PeerIdentity)> = self
            .registry
            .ready()
            .filter(|p| !exclude.contains(&p.id))
            .map(|p| (p.id, p.identity.clone()))
            .collect();
        let allowed: HashSet<PeerId> = candidates
            .into_iter()
            .filter(|(_, identity)| !self.reputation.is_blacklisted(identity, now))
            .map(|(id, _)| id)
            .collect();

        let chosen = best(
            self.registry.ready().filter(|p| allowed.contains(&p.id)),
            now,
        )
        .map(|p| (p.id, p.supports_batch));
        let Some((peer_id, supports_batch)) = chosen else {
            return Err(DispatchRefusal::NoPeers);
        };

        let cpu = self.resources.latest().cpu_usage;
        let in_flight = self.requests.in_flight();
        let limit = download_concurrency_limit(self.registry.ready_count(), cpu, in_flight);
        if in_flight >= limit {
            tracing::debug!(in_flight, limit, "Download concurrency limit reached");
            return Err(DispatchRefusal::Saturated);
        }

        let request_id = self.requests.allocate_id();
        let (events_tx, events) = mpsc::unbounded_channel();
        self.requests.insert(
            request_id,
            PendingRequest::new(peer_id, hash.clone(), size, events_tx, now),
        );

        let command = PeerCommand::Request {
            request_id,
            payload: RequestPayload::Hash(hash.clone()),
            batchable: supports_batch && size < SMALL_ASSET_THRESHOLD,
        };
        if !self.registry.send(&peer_id, command) {
            self.requests.cancel(request_id);
            return Err(DispatchRefusal::NoPeers);
        }
        if let Some(peer) = self.registry.get_mut(&peer_id) {
            peer.active_requests += 1;
        }

        tracing::debug!(request_id, peer = %peer_id, hash = %hash, size, "Request assigned");
        Ok(RequestTicket {
            request_id,
            peer_id,
            events,
        })
    }

    fn admit(&mut self, request: AdmissionRequest) {
        let decision = self.check_admission(request.peer_id, request.charge);
        if let Err(reason) = &decision {
            tracing::debug!(peer = %request.peer_id, reason, "Upload refused");
        }
        if let Err(Ok(grant)) = request.reply.send(decision) {
            // The serving task is gone; release the slot right away
            self.uploads.finish(grant.upload_id, 0, Duration::ZERO, Instant::now());
        }
    }

    /// Global cap, per-IP cap, owner busy, toggles, then credits.
    fn check_admission(&mut self, peer_id: PeerId, charge: bool) -> Result<UploadGrant, &'static str> {
        if !self.is_running() {
            return Err(reasons::DISABLED);
        }
        let Some(peer) = self.registry.get(&peer_id) else {
            return Err(reasons::INTERNAL);
        };
        let (ip, lan) = (peer.addr.ip(), peer.lan);
        let now = Instant::now();

        self.uploads.check_capacity(ip)?;
        if self.traffic.is_busy() {
            return Err(reasons::OWNER_BUSY);
        }
        let enabled = if lan {
            self.config.local_upload_enabled
        } else {
            self.config.upload_enabled
        };
        if !enabled || self.health.is_isolated(now) {
            return Err(reasons::DISABLED);
        }
        if charge && !self.usage.reserve(ip, 1, now) {
            return Err(reasons::RATE_LIMITED);
        }

        let upload_id = self.uploads.start(peer_id, ip, lan, charge, now);
        Ok(UploadGrant {
            upload_id,
            throttled: !lan,
        })
    }

    fn finish_upload(&mut self, report: UploadReport) {
        let now = Instant::now();
        let Some(upload) = self
            .uploads
            .finish(report.upload_id, report.bytes, report.elapsed, now)
        else {
            return;
        };

        if upload.charged {
            match report.outcome {
                UploadOutcome::NotFound => self.usage.refund(upload.ip, 1, now),
                UploadOutcome::Completed | UploadOutcome::Aborted => {
                    let remaining = cost_for(report.bytes).saturating_sub(1);
                    if remaining > 0 {
                        self.usage.consume(upload.ip, remaining, now);
                    }
                }
            }
        }

        tracing::debug!(
            peer = %report.peer_id,
            bytes = report.bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            outcome = ?report.outcome,
            "Upload finished"
        );
    }

    async fn strike(&mut self, peer_id: PeerId, reason: &str) {
        let Some(peer) = self.registry.get(&peer_id) else {
            return;
        };
        let identity = peer.identity.clone();
        let now = Instant::now();

        match self.reputation.strike(&identity, now) {
            StrikeOutcome::Recorded(strikes) => {
                tracing::warn!(peer = %peer_id, identity = %identity, strikes, reason, "Peer strike");
                for peer in self.registry.iter_mut().filter(|p| p.identity == identity) {
                    peer.strikes = strikes;
                }
            }
            StrikeOutcome::Blacklisted(until) => {
                let cooldown_secs = until.saturating_duration_since(now).as_secs();
                tracing::warn!(peer = %peer_id, identity = %identity, cooldown_secs, reason, "Peer blacklisted");
                let ids: Vec<PeerId> = self
                    .registry
                    .iter()
                    .filter(|p| p.identity == identity)
                    .map(|p| p.id)
                    .collect();
                for id in ids {
                    self.registry.disconnect(&id);
                }
            }
        }

        if self.breaker.record(&identity, now) {
            self.panic_stop().await;
        }
    }

    async fn panic_stop(&mut self) {
        tracing::warn!(
            restart_in_secs = PANIC_RESTART_DELAY.as_secs(),
            "Abuse from many peers, stopping P2P engine"
        );
        self.breaker.reset();
        self.stop().await;
        self.restart_at = Some(Instant::now() + PANIC_RESTART_DELAY);
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();

        if self.is_running() {
            for peer_id in self.requests.expire(now, self.config.request_timeout) {
                self.release_request_slot(peer_id);
            }
        }

        if self.health.take_expired_isolation(now) {
            let profile = self.adapter.restore();
            tracing::info!(weight = profile.weight, "Isolation ended, profile restored");
            self.publish_profile();
            self.refresh_join().await;
        }

        if let Some(at) = self.restart_at {
            if now >= at && self.state() == EngineState::Stopped {
                self.restart_at = None;
                tracing::info!("Restarting P2P engine");
                if let Err(e) = self.start().await {
                    tracing::warn!(error = %e, "Restart failed, retrying");
                    self.restart_at = Some(now + NETWORK_SETTLE_DELAY);
                }
            }
        }
    }

    async fn health_check(&mut self) {
        let now = Instant::now();
        let sample = self.resources.latest();

        if sample.cpu_usage >= CPU_STRESS_PERCENT && !self.adapter.is_downgraded() {
            let profile = self.adapter.penalize();
            tracing::warn!(cpu = sample.cpu_usage, weight = profile.weight, "CPU stress, lowering weight");
            self.publish_profile();
        } else if sample.cpu_usage < CPU_CALM_PERCENT
            && self.adapter.current().weight < self.adapter.base().weight
            && !self.adapter.is_downgraded()
        {
            let profile = self.adapter.recover();
            tracing::debug!(weight = profile.weight, "CPU calm, weight recovering");
            self.publish_profile();
        }

        if self.is_running() {
            let speeds = self.uploads.window_speeds(now, HEALTH_CHECK_INTERVAL);
            match self.health.evaluate(&speeds, now) {
                HealthVerdict::Inconclusive | HealthVerdict::Healthy => {}
                HealthVerdict::SelfStrike(strikes) => {
                    tracing::warn!(strikes, uploaders = speeds.len(), "Every uploader slow, self strike");
                }
                HealthVerdict::Isolate(until) => {
                    let secs = until.saturating_duration_since(now).as_secs();
                    tracing::warn!(isolation_secs = secs, "Repeated slow uploads, isolating");
                    self.adapter.force_downgrade();
                    self.publish_profile();
                }
            }
        }

        let download_bps = self.traffic.take_downloaded() as f64 / HEALTH_CHECK_INTERVAL.as_secs_f64();
        let ceiling = upload_ceiling(
            self.adapter.base().tier,
            download_bps,
            sample.load_average,
            sample.cores,
        );
        if ceiling != self.limiter.rate() {
            tracing::debug!(ceiling, download_bps, "Upload ceiling changed");
            self.limiter.set_rate(ceiling);
        }

        self.refresh_join().await;
    }

    async fn check_network(&mut self) {
        if !self.is_running() {
            return;
        }
        let fingerprint = self.interfaces.fingerprint();
        if fingerprint == self.fingerprint {
            return;
        }
        tracing::info!(
            old = ?self.fingerprint,
            new = ?fingerprint,
            "Network changed, restarting P2P engine"
        );
        self.stop().await;
        self.restart_at = Some(Instant::now() + NETWORK_SETTLE_DELAY);
    }

    /// Record a peer in the cache if we know where it listens.
    fn remember(&mut self, peer: &Peer, now: Instant) {
        let Some(listen) = peer.listen_addr else {
            return;
        };
        let scope = if peer.lan {
            PeerScope::Local
        } else {
            PeerScope::Global
        };
        let record = PersistedPeerRecord::new(
            listen,
            score(peer, now),
            peer.last_speed.unwrap_or(0.0),
            unix_now(),
        );
        self.cache.upsert(scope, record);
    }

    fn remember_connected(&mut self) {
        let now = Instant::now();
        let peers: Vec<Peer> = self.registry.iter().cloned().collect();
        for peer in &peers {
            self.remember(peer, now);
        }
    }

    fn queue_save(&mut self) {
        self.remember_connected();
        let Some(writer) = &self.writer else {
            return;
        };
        match self.cache.to_sealed(unix_now()) {
            Ok(blob) => {
                writer.submit(blob);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to seal peer cache"),
        }
    }

    /// Hand the final snapshot to the writer and wait for it to drain.
    async fn flush_cache(&mut self) {
        let blob = match self.cache.to_sealed(unix_now()) {
            Ok(blob) => Some(blob),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to seal peer cache");
                None
            }
        };
        match (self.writer.take(), blob) {
            (Some(writer), Some(blob)) => writer.finish(blob).await,
            (Some(writer), None) => writer.close().await,
            (None, Some(blob)) => {
                if let Err(e) = write_atomic(self.cache.path(), &blob).await {
                    tracing::warn!(error = %e, "Failed to save peer cache");
                }
            }
            (None, None) => {}
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let now = Instant::now();
        let peers = self
            .registry
            .iter()
            .map(|p| PeerSnapshot {
                id: p.id,
                addr: p.addr,
                direction: p.direction,
                ready: p.is_ready(),
                lan: p.lan,
                weight: p.weight,
                rtt: p.rtt,
                last_speed: p.last_speed,
                strikes: p.strikes,
                active_requests: p.active_requests,
                bytes_recv: p.bytes_recv,
            })
            .collect();

        EngineSnapshot {
            state: self.state(),
            listen_addr: self.listen_addr,
            announcing: self.joined.map_or(false, |j| j.server),
            isolated: self.health.is_isolated(now),
            profile: self.adapter.current(),
            peers,
            active_uploads: self.uploads.active(),
            in_flight: self.requests.in_flight(),
            blacklisted: self.reputation.blacklisted_count(),
            upload_ceiling: self.limiter.rate(),
        }
    }
}

async fn accept_loop(listener: InboundListener, events: mpsc::UnboundedSender<InternalEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if events.send(InternalEvent::Inbound(stream, addr)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::path::Path;

    use crate::policy::health::SELF_STRIKES_TO_ISOLATE;
    use crate::store::DirStore;
    use crate::system::{ResourceSample, SystemTier};

    struct StaticNetwork;

    impl InterfaceProbe for StaticNetwork {
        fn primary_ipv4(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::LOCALHOST)
        }
    }

    struct Harness {
        supervisor: Supervisor,
        _commands: mpsc::UnboundedSender<EngineCommand>,
        _watchers: (watch::Receiver<EngineState>, watch::Receiver<usize>, watch::Receiver<Profile>),
    }

    fn harness(dir: &Path, traffic: Arc<TrafficState>) -> Harness {
        let config = EngineConfig::new("127.0.0.1:0".parse().unwrap())
            .with_beacon_port(None)
            .with_peers_file(dir.join("peers.dat"));
        let ctx = EngineContext::new(Arc::new(DirStore::new(dir.join("content"))), [7u8; 32])
            .with_traffic(traffic)
            .with_adapter(NodeAdapter::new(SystemTier::High))
            .with_resources(ResourceMonitor::fixed(ResourceSample::idle()))
            .with_interfaces(Arc::new(StaticNetwork));

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(EngineState::Stopped);
        let (peers, peers_rx) = watch::channel(0);
        let (profile, profile_rx) = watch::channel(ctx.adapter.current());
        let supervisor = Supervisor::new(config, ctx, commands, Publishers { state, peers, profile });

        Harness {
            supervisor,
            _commands: commands_tx,
            _watchers: (state_rx, peers_rx, profile_rx),
        }
    }

    fn add_internet_peer(supervisor: &mut Supervisor) -> PeerId {
        let peer_id = supervisor.registry.next_peer_id();
        let addr: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        supervisor
            .registry
            .add(Peer::new(peer_id, addr, ConnectionDirection::Inbound, false), tx);
        peer_id
    }

    fn record_slow_uploaders(supervisor: &mut Supervisor, count: u8) {
        let now = Instant::now();
        for i in 1..=count {
            let ip = IpAddr::from([198, 51, 100, i]);
            let id = supervisor
                .uploads
                .start(PeerId::new(1000 + u64::from(i)), ip, false, false, now);
            supervisor.uploads.finish(id, 10_000, Duration::from_secs(1), now);
        }
    }

    #[tokio::test]
    async fn test_isolation_stops_announcing_and_refuses_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), TrafficState::new());
        let sup = &mut h.supervisor;

        sup.start().await.unwrap();
        let snapshot = sup.snapshot();
        assert!(snapshot.announcing);
        assert!(!snapshot.isolated);

        let peer_id = add_internet_peer(sup);
        let grant = sup.check_admission(peer_id, false).unwrap();
        sup.uploads.finish(grant.upload_id, 0, Duration::ZERO, Instant::now());

        record_slow_uploaders(sup, 3);
        for _ in 0..SELF_STRIKES_TO_ISOLATE {
            sup.health_check().await;
        }

        let snapshot = sup.snapshot();
        assert!(snapshot.isolated);
        assert!(!snapshot.announcing);
        assert!(snapshot.listen_addr.is_none());
        assert_eq!(snapshot.state, EngineState::Running);
        assert!(matches!(
            sup.check_admission(peer_id, false),
            Err(reason) if reason == reasons::DISABLED
        ));

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_two_slow_windows_keep_announcing() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), TrafficState::new());
        let sup = &mut h.supervisor;

        sup.start().await.unwrap();
        record_slow_uploaders(sup, 3);
        for _ in 1..SELF_STRIKES_TO_ISOLATE {
            sup.health_check().await;
        }

        let snapshot = sup.snapshot();
        assert!(!snapshot.isolated);
        assert!(snapshot.announcing);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_local_download_makes_owner_busy() {
        let dir = tempfile::tempdir().unwrap();
        let traffic = TrafficState::new();
        let mut h = harness(dir.path(), traffic.clone());
        let sup = &mut h.supervisor;

        sup.start().await.unwrap();
        let peer_id = add_internet_peer(sup);

        let activity = traffic.begin_download();
        assert!(matches!(
            sup.check_admission(peer_id, false),
            Err(reason) if reason == reasons::OWNER_BUSY
        ));
        assert_eq!(sup.uploads.active(), 0);

        drop(activity);
        assert!(sup.check_admission(peer_id, false).is_ok());
        assert_eq!(sup.uploads.active(), 1);

        sup.stop().await;
    }
}
