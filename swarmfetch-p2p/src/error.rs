//! P2P error types.

use std::io;
use std::net::SocketAddr;

use swarmfetch_core::{ContentIdError, SealError};
use thiserror::Error;

/// Broad category of a failure, used to decide who is penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or oversized frames; the connection is closed, no strike.
    ProtocolViolation,
    /// Hostile behavior; the peer earns a strike.
    SecurityViolation,
    /// A transfer did not complete; another peer may be tried.
    TransientPeerFailure,
    /// Local limits or lack of peers.
    ResourceExhaustion,
    /// Digest mismatch.
    IntegrityFailure,
    /// Local trouble that is logged rather than surfaced.
    SystemDegradation,
}

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer sent a frame that breaks the wire protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Frame payload exceeds the maximum allowed size.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Too many bytes buffered on a connection.
    #[error("Buffer overrun: {buffered} bytes buffered (max: {max})")]
    BufferOverrun { buffered: usize, max: usize },

    /// Unknown frame type byte.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Peer asked for something that is not a content id.
    #[error("Invalid content id: {0}")]
    InvalidContentId(#[from] ContentIdError),

    /// Peer asked for a path that escapes the content root.
    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    /// Peer kept sending past the expected size plus tolerance.
    #[error("Transfer exceeded size limit: {received} bytes received, expected {expected}")]
    SizeLimitExceeded { expected: u64, received: u64 },

    /// END arrived with a byte count different from the expected size.
    #[error("Incomplete transfer: {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },

    /// No frame arrived within the request timeout.
    #[error("Request timed out after {received} bytes")]
    Timeout { received: u64 },

    /// Peer answered with an ERROR frame.
    #[error("Peer refused: {reason}")]
    Remote { reason: String, received: u64 },

    /// Peer disconnected while serving the request.
    #[error("Peer disconnected: {reason}")]
    PeerDisconnected { reason: String, received: u64 },

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// No connected peer could be tried.
    #[error("No peers available")]
    NoPeers,

    /// Local download concurrency limit reached.
    #[error("Download concurrency limit reached")]
    Saturated,

    /// Usage credits exhausted.
    #[error("Rate limited")]
    RateLimited,

    /// Engine is not running.
    #[error("Engine stopped")]
    EngineStopped,

    /// Peer cache could not be sealed or opened.
    #[error("Peer cache sealing failed: {0}")]
    Seal(#[from] SealError),

    /// Peer cache could not be encoded or decoded.
    #[error("Peer cache format error: {0}")]
    Persistence(String),
}

impl P2pError {
    /// The category this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            P2pError::Protocol(_)
            | P2pError::FrameTooLarge { .. }
            | P2pError::BufferOverrun { .. }
            | P2pError::UnknownMessageType(_) => ErrorClass::ProtocolViolation,
            P2pError::InvalidContentId(_)
            | P2pError::PathTraversal(_)
            | P2pError::SizeLimitExceeded { .. } => ErrorClass::SecurityViolation,
            P2pError::Io(_)
            | P2pError::Incomplete { .. }
            | P2pError::Timeout { .. }
            | P2pError::Remote { .. }
            | P2pError::PeerDisconnected { .. }
            | P2pError::ConnectionTimeout { .. } => ErrorClass::TransientPeerFailure,
            P2pError::NoPeers
            | P2pError::Saturated
            | P2pError::RateLimited
            | P2pError::EngineStopped => ErrorClass::ResourceExhaustion,
            P2pError::Seal(_) | P2pError::Persistence(_) => ErrorClass::SystemDegradation,
        }
    }

    /// Bytes received before a transfer failed.
    pub fn bytes_received(&self) -> u64 {
        match self {
            P2pError::SizeLimitExceeded { received, .. }
            | P2pError::Incomplete { received, .. }
            | P2pError::Timeout { received }
            | P2pError::Remote { received, .. }
            | P2pError::PeerDisconnected { received, .. } => *received,
            _ => 0,
        }
    }

    /// Whether the failure justifies a strike against the peer.
    pub fn is_security_violation(&self) -> bool {
        self.class() == ErrorClass::SecurityViolation
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Persistence(err.to_string())
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
