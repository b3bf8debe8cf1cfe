//! # Swarmfetch Race
//!
//! Per-asset delivery decisions:
//! - Race direct HTTP against the peer swarm when the URL names a content hash
//! - Verify whichever side wins against that hash
//! - Fall back through HTTP mirrors when both sides fail
//! - Boost the node's weight after a run of peer wins

pub mod error;
pub mod http;
pub mod race;
pub mod source;

pub use error::{RaceError, RaceResult};
pub use http::{HttpClient, HttpResponse, ReqwestClient, DEFAULT_CONNECT_TIMEOUT};
pub use race::{
    AssetRequest, Delivery, DeliverySource, Downloaded, RaceConfig, RaceManager, P2P_STREAK_BOOST,
};
pub use source::PeerSource;
