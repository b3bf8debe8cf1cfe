//! Engine configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum frame payload in bytes (1 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Maximum unconsumed bytes buffered per connection (2 MiB).
pub const MAX_BUFFERED_BYTES: usize = 2 * 1024 * 1024;

/// Bytes a transfer may exceed its expected size by before it is rejected.
pub const TRANSFER_SIZE_TOLERANCE: u64 = 1024 * 1024;

/// Assets below this size are eligible for batch requests.
pub const SMALL_ASSET_THRESHOLD: u64 = 1024 * 1024;

/// Maximum entries in one BATCH_REQUEST frame.
pub const MAX_BATCH_ENTRIES: usize = 50;

/// Window over which outgoing small requests are coalesced.
pub const BATCH_FLUSH_WINDOW: Duration = Duration::from_millis(20);

/// Capability bit advertising batch support.
pub const CAP_BATCH: u8 = 0b0000_0001;

/// Connection closed after this long without any inbound frame.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A request with no frame for this long fails with a timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default outbound TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default global concurrent-upload cap.
pub const DEFAULT_MAX_UPLOADS: usize = 32;

/// Concurrent uploads allowed to one IP.
pub const MAX_UPLOADS_PER_IP: usize = 20;

/// Delay between attempts after a failure with no bytes received.
pub const SOFT_FAILURE_BACKOFF: Duration = Duration::from_millis(200);

/// How long a request waits for a first peer to join.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum number of candidate attempts per request.
pub const MIN_REQUEST_ATTEMPTS: usize = 10;

/// Strikes that blacklist a peer identity.
pub const STRIKES_TO_BLACKLIST: u32 = 3;

/// How long a blacklisted identity stays out.
pub const BLACKLIST_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Interval of the strike decay sweep.
pub const STRIKE_DECAY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Distinct abusive identities that trip the circuit breaker.
pub const CIRCUIT_BREAKER_TRIGGERS: usize = 5;

/// Window in which circuit breaker triggers are counted.
pub const CIRCUIT_BREAKER_WINDOW: Duration = Duration::from_secs(60);

/// Delay before the engine restarts after a panic stop.
pub const PANIC_RESTART_DELAY: Duration = Duration::from_secs(5 * 60);

/// Interval of the self health check and upload ceiling refresh.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Duration of self-isolation after repeated health failures.
pub const ISOLATION_DURATION: Duration = Duration::from_secs(60 * 60);

/// Interval between network fingerprint checks.
pub const NETWORK_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Settle delay before restarting after a network change.
pub const NETWORK_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Interval between outbound dial rounds.
pub const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between peer cache saves.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default TCP port for peer connections.
pub const DEFAULT_LISTEN_PORT: u16 = 47821;

/// Default UDP port for LAN beacons.
pub const DEFAULT_BEACON_PORT: u16 = 47822;

/// Configuration for the P2P engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the peer listener binds to when announcing.
    pub listen_addr: SocketAddr,

    /// UDP port used for LAN beacons (`None` disables the beacon).
    pub beacon_port: Option<u16>,

    /// Peers dialled on every start, in addition to cached ones.
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Path of the encrypted peer cache.
    pub peers_file: PathBuf,

    /// Serve uploads to internet peers.
    pub upload_enabled: bool,

    /// Serve uploads to same-subnet peers.
    pub local_upload_enabled: bool,

    /// Participate in LAN sharing even when internet uploads are off.
    pub local_optimization: bool,

    /// Global concurrent-upload cap.
    pub max_uploads: usize,

    /// Concurrent uploads allowed per IP.
    pub max_uploads_per_ip: usize,

    /// Bytes a transfer may exceed its expected size by.
    pub size_tolerance: u64,

    /// Charge usage credits for entries of a batch request.
    pub batch_charges_usage: bool,

    /// Idle timeout per connection.
    pub idle_timeout: Duration,

    /// Keepalive ping interval per connection.
    pub keepalive_interval: Duration,

    /// Inactivity timeout per request.
    pub request_timeout: Duration,

    /// Outbound connect timeout.
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            beacon_port: Some(DEFAULT_BEACON_PORT),
            bootstrap_peers: Vec::new(),
            peers_file: PathBuf::from("peers.dat"),
            upload_enabled: true,
            local_upload_enabled: true,
            local_optimization: true,
            max_uploads: DEFAULT_MAX_UPLOADS,
            max_uploads_per_ip: MAX_UPLOADS_PER_IP,
            size_tolerance: TRANSFER_SIZE_TOLERANCE,
            batch_charges_usage: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with the specified listen address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set the LAN beacon port, or disable the beacon.
    pub fn with_beacon_port(mut self, port: Option<u16>) -> Self {
        self.beacon_port = port;
        self
    }

    /// Add bootstrap peers to dial on startup.
    pub fn with_bootstrap_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Set the peer cache path.
    pub fn with_peers_file(mut self, path: PathBuf) -> Self {
        self.peers_file = path;
        self
    }

    /// Enable or disable uploads to internet peers.
    pub fn with_upload_enabled(mut self, enabled: bool) -> Self {
        self.upload_enabled = enabled;
        self
    }

    /// Enable or disable uploads to LAN peers.
    pub fn with_local_upload_enabled(mut self, enabled: bool) -> Self {
        self.local_upload_enabled = enabled;
        self
    }

    /// Enable or disable LAN participation.
    pub fn with_local_optimization(mut self, enabled: bool) -> Self {
        self.local_optimization = enabled;
        self
    }

    /// Set the global concurrent-upload cap.
    pub fn with_max_uploads(mut self, count: usize) -> Self {
        self.max_uploads = count;
        self
    }

    /// Set the over-size tolerance for incoming transfers.
    pub fn with_size_tolerance(mut self, bytes: u64) -> Self {
        self.size_tolerance = bytes;
        self
    }

    /// Set the per-request inactivity timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-connection idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the outbound connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether any upload toggle allows serving.
    pub fn serves_anyone(&self) -> bool {
        self.upload_enabled || self.local_optimization
    }
}
