//! Messages between engine handles and the supervisor.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use swarmfetch_core::ContentHash;
use tokio::sync::{mpsc, oneshot};

use crate::error::{P2pError, P2pResult};
use crate::peer::{ConnectionDirection, PeerId};
use crate::system::Profile;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Why the supervisor could not assign a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRefusal {
    /// No untried, ready, non-blacklisted peer.
    NoPeers,
    /// Download concurrency limit reached.
    Saturated,
    /// The engine is not running.
    NotRunning,
}

/// Progress of one assigned request, as seen by its requester.
#[derive(Debug)]
pub enum TransferEvent {
    Data(Bytes),
    End,
    Failed(P2pError),
}

/// A request assigned to a peer.
#[derive(Debug)]
pub struct RequestTicket {
    pub request_id: u32,
    pub peer_id: PeerId,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

/// Point-in-time view of one connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub direction: ConnectionDirection,
    pub ready: bool,
    pub lan: bool,
    pub weight: u8,
    pub rtt: Option<Duration>,
    pub last_speed: Option<f64>,
    pub strikes: u32,
    pub active_requests: usize,
    pub bytes_recv: u64,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub listen_addr: Option<SocketAddr>,
    pub announcing: bool,
    pub isolated: bool,
    pub profile: Profile,
    pub peers: Vec<PeerSnapshot>,
    pub active_uploads: usize,
    pub in_flight: usize,
    pub blacklisted: usize,
    pub upload_ceiling: u64,
}

/// Commands handled by the supervisor.
#[derive(Debug)]
pub enum EngineCommand {
    Start {
        reply: oneshot::Sender<P2pResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    /// Assign a request to the best untried peer.
    BeginRequest {
        hash: ContentHash,
        size: u64,
        exclude: HashSet<PeerId>,
        reply: oneshot::Sender<Result<RequestTicket, DispatchRefusal>>,
    },
    /// The requester is gone; stop routing frames for this request.
    CancelRequest {
        request_id: u32,
    },
    /// Add a dial candidate and dial it now if possible.
    AddPeer(SocketAddr),
    BoostWeight,
    PenalizeWeight,
    SetUploadEnabled(bool),
    SetLocalUploadEnabled(bool),
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
}
