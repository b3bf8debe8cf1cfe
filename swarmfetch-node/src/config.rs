//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use swarmfetch_core::HostIdentity;
use swarmfetch_p2p::config::{DEFAULT_BEACON_PORT, DEFAULT_LISTEN_PORT};
use swarmfetch_p2p::EngineConfig;
use swarmfetch_race::RaceConfig;
use sysinfo::System;

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for content and the peer cache.
    pub data_dir: PathBuf,

    /// Peer listen address.
    pub listen_addr: SocketAddr,

    /// LAN beacon port, if beacons are enabled.
    pub beacon_port: Option<u16>,

    /// Peers to dial on start.
    pub bootstrap_peers: Vec<SocketAddr>,

    /// HTTP mirror base URLs.
    pub mirrors: Vec<String>,

    /// Serve internet peers.
    pub upload_enabled: bool,

    /// Serve LAN peers.
    pub local_upload_enabled: bool,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            data_dir: cli.expanded_data_dir(),
            listen_addr: cli.listen,
            beacon_port: (!cli.no_beacon).then_some(cli.beacon_port),
            bootstrap_peers: cli.bootstrap.clone().unwrap_or_default(),
            mirrors: cli.mirrors.clone().unwrap_or_default(),
            upload_enabled: !cli.no_upload,
            local_upload_enabled: !cli.no_local_upload,
        }
    }

    /// Served content lives here.
    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.dat")
    }

    /// Build the engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.listen_addr)
            .with_beacon_port(self.beacon_port)
            .with_bootstrap_peers(self.bootstrap_peers.clone())
            .with_peers_file(self.peers_file())
            .with_upload_enabled(self.upload_enabled)
            .with_local_upload_enabled(self.local_upload_enabled)
    }

    pub fn race_config(&self) -> RaceConfig {
        RaceConfig::default().with_mirrors(self.mirrors.clone())
    }

    /// Identity material binding the peer cache key to this host and user.
    pub fn host_identity(&self) -> HostIdentity {
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        HostIdentity::new(host, user, &self.data_dir)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".swarmfetch"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            beacon_port: Some(DEFAULT_BEACON_PORT),
            bootstrap_peers: Vec::new(),
            mirrors: Vec::new(),
            upload_enabled: true,
            local_upload_enabled: true,
        }
    }
}
