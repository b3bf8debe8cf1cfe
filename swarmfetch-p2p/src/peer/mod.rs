//! Peer connections.
//!
//! This module provides:
//! - Peer identification and per-connection metadata
//! - Connection state
//! - Per-connection reader/writer tasks and upload serving

pub mod handler;
pub mod info;
pub mod state;

pub use handler::{
    spawn_peer_connection, AdmissionRequest, HandlerContext, PeerCommand, PeerEvent, UploadGrant,
    UploadOutcome, UploadReport, SERVE_SLOT_MARGIN,
};
pub use info::{ConnectionDirection, Peer, PeerId, PeerIdentity};
pub use state::PeerState;
