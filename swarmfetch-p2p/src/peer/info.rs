//! Peer information and identification.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use swarmfetch_core::sha256;

use crate::peer::PeerState;
use crate::protocol::Hello;

/// Unique identifier for a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Create a new peer ID from a counter value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Stable identity used for strikes and blacklisting.
///
/// Derived from the remote IP so that reconnecting from a new port keeps
/// the same reputation. Nodes sharing one public address share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn from_ip(ip: IpAddr) -> Self {
        let digest = sha256(ip.to_string().as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// A connected peer, as tracked by the engine.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Unique peer identifier for this session.
    pub id: PeerId,
    /// Reputation identity.
    pub identity: PeerIdentity,
    /// Socket address of the connection.
    pub addr: SocketAddr,
    /// Direction of the connection.
    pub direction: ConnectionDirection,
    /// Address the peer accepts connections on, when known.
    pub listen_addr: Option<SocketAddr>,
    /// Connection state.
    pub state: PeerState,
    /// Advertised weight (0 until HELLO).
    pub weight: u8,
    /// Whether the peer accepts batch requests.
    pub supports_batch: bool,
    /// Whether the peer is on the local subnet.
    pub lan: bool,
    /// Latest round-trip time.
    pub rtt: Option<Duration>,
    /// Speed of the last completed transfer from this peer, bytes/s.
    pub last_speed: Option<f64>,
    /// When `last_speed` was measured.
    pub speed_observed_at: Option<Instant>,
    /// Strikes held by this peer's identity.
    pub strikes: u32,
    /// Requests currently assigned to this peer.
    pub active_requests: usize,
    /// When the connection was established.
    pub connected_at: Instant,
    /// Bytes received from this peer.
    pub bytes_recv: u64,
}

impl Peer {
    /// Create a peer for a freshly accepted or dialled connection.
    pub fn new(id: PeerId, addr: SocketAddr, direction: ConnectionDirection, lan: bool) -> Self {
        let listen_addr = match direction {
            ConnectionDirection::Outbound => Some(addr),
            ConnectionDirection::Inbound => None,
        };
        Self {
            id,
            identity: PeerIdentity::from_ip(addr.ip()),
            addr,
            direction,
            listen_addr,
            state: PeerState::AwaitingHello,
            weight: 0,
            supports_batch: false,
            lan,
            rtt: None,
            last_speed: None,
            speed_observed_at: None,
            strikes: 0,
            active_requests: 0,
            connected_at: Instant::now(),
            bytes_recv: 0,
        }
    }

    /// Apply the remote HELLO; the peer becomes ready.
    pub fn complete_hello(&mut self, hello: Hello) {
        self.weight = hello.weight;
        self.supports_batch = hello.supports_batch();
        self.state = PeerState::Ready;
    }

    /// Record a completed transfer of `bytes` over `elapsed`.
    pub fn record_transfer(&mut self, bytes: u64, elapsed: Duration, now: Instant) {
        let secs = elapsed.as_secs_f64().max(0.001);
        self.last_speed = Some(bytes as f64 / secs);
        self.speed_observed_at = Some(now);
    }

    /// Check if the peer can be assigned requests.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Check if this is an outbound connection.
    pub fn is_outbound(&self) -> bool {
        self.direction == ConnectionDirection::Outbound
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, weight={}{})",
            self.id,
            self.addr,
            self.direction,
            self.weight,
            if self.lan { ", lan" } else { "" }
        )
    }
}
