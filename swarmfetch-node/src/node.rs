//! Node orchestrator.
//!
//! Wires the peer engine, the race manager and the content store together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use swarmfetch_core::{extract_content_hash, KeyDeriver};
use swarmfetch_p2p::{DirStore, EngineContext, P2pEngine, TrafficState};
use swarmfetch_race::{
    AssetRequest, Downloaded, RaceManager, ReqwestClient, DEFAULT_CONNECT_TIMEOUT,
};

use crate::config::NodeConfig;
use crate::shutdown::{shutdown_channel, wait_for_shutdown_signal, ShutdownTx};

/// How often `run` logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for the engine task after a stop.
const ENGINE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a one-shot fetch waits for bootstrap peers before racing.
const FETCH_PEER_WAIT: Duration = Duration::from_secs(3);

/// The main node structure.
pub struct Node {
    config: NodeConfig,
    store: DirStore,
    engine: P2pEngine,
    engine_task: JoinHandle<()>,
    race: RaceManager,
    shutdown_tx: ShutdownTx,
}

impl Node {
    /// Create a new node with the given configuration.
    pub async fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let content_dir = config.content_dir();
        tokio::fs::create_dir_all(&content_dir).await?;
        tracing::info!("Data directory: {:?}", config.data_dir);

        let cache_key = KeyDeriver::new().derive(&config.host_identity())?;
        let store = DirStore::new(content_dir);
        let traffic = TrafficState::new();

        let ctx = EngineContext::new(Arc::new(store.clone()), cache_key)
            .with_traffic(traffic.clone());
        let (engine, engine_task) = P2pEngine::spawn(config.engine_config(), ctx);

        let http = ReqwestClient::new(DEFAULT_CONNECT_TIMEOUT)?;
        let race = RaceManager::new(config.race_config(), Arc::new(http), traffic)
            .with_peers(Arc::new(engine.clone()));

        let (shutdown_tx, _) = shutdown_channel();

        Ok(Self {
            config,
            store,
            engine,
            engine_task,
            race,
            shutdown_tx,
        })
    }

    /// Serve the swarm until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting swarmfetch node...");
        tracing::info!("  Listen address: {}", self.config.listen_addr);
        match self.config.beacon_port {
            Some(port) => tracing::info!("  LAN beacon port: {}", port),
            None => tracing::info!("  LAN beacons disabled"),
        }
        tracing::info!("  Uploads: internet={} lan={}", self.config.upload_enabled, self.config.local_upload_enabled);

        self.engine.start().await?;
        tracing::info!("Engine started as {:?} tier", self.engine.profile().tier);

        let status_handle = self.spawn_status_task();

        wait_for_shutdown_signal().await;

        tracing::info!("Shutting down node...");
        let _ = self.shutdown_tx.send(());
        let _ = status_handle.await;

        self.shutdown().await;
        tracing::info!("Node shutdown complete");
        Ok(())
    }

    /// Download one asset to `output`. Assets addressed by hash are also
    /// placed in the content store so later runs can seed them.
    pub async fn fetch(self, url: &str, size: Option<u64>, output: &Path) -> anyhow::Result<Downloaded> {
        self.engine.start().await?;
        if !self.config.bootstrap_peers.is_empty() {
            self.engine.wait_for_peers(1, FETCH_PEER_WAIT).await;
        }

        let request = AssetRequest::new(url, size);
        let result = self.race.download(&request, output).await;

        if let Ok(downloaded) = &result {
            tracing::info!(
                "Fetched {} bytes from {:?} into {:?}",
                downloaded.bytes,
                downloaded.source,
                downloaded.path
            );
            if let Some(hash) = extract_content_hash(url) {
                match self.seed_copy(&downloaded.path, self.store.object_path(&hash)).await {
                    Ok(path) => tracing::debug!("Seeding {} from {:?}", hash, path),
                    Err(e) => tracing::warn!("Failed to add {} to the content store: {}", hash, e),
                }
            }
        }

        self.shutdown().await;
        Ok(result?)
    }

    async fn seed_copy(&self, from: &Path, to: PathBuf) -> std::io::Result<PathBuf> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from, &to).await?;
        Ok(to)
    }

    fn spawn_status_task(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match engine.snapshot().await {
                            Ok(s) => tracing::info!(
                                "Status: state={:?} peers={} uploads={} in_flight={} blacklisted={} isolated={}",
                                s.state,
                                s.peers.len(),
                                s.active_uploads,
                                s.in_flight,
                                s.blacklisted,
                                s.isolated
                            ),
                            Err(e) => {
                                tracing::warn!("Engine status unavailable: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn shutdown(self) {
        if let Err(e) = self.engine.stop().await {
            tracing::debug!("Engine already stopped: {}", e);
        }

        // The supervisor exits once every engine handle is gone.
        let Self {
            engine,
            engine_task,
            race,
            ..
        } = self;
        drop(race);
        drop(engine);

        if tokio::time::timeout(ENGINE_JOIN_TIMEOUT, engine_task).await.is_err() {
            tracing::warn!("Engine task did not exit within {:?}", ENGINE_JOIN_TIMEOUT);
        }
    }
}
