//! Peer-to-peer asset distribution for swarmfetch.
//!
//! This crate lets nodes fetch content-addressed assets from each other:
//!
//! - A small framed wire protocol (REQUEST / DATA / END / ERROR, batching)
//! - Discovery through bootstrap peers, LAN beacons and a sealed peer cache
//! - Peer scoring, strikes, blacklisting and an abuse circuit breaker
//! - Per-IP usage credits and a throttled upload path
//! - Self health checks that back the node off when it serves badly
//!
//! # Architecture
//!
//! One supervisor task owns all engine state. Every connection runs its own
//! reader and writer tasks that talk to the supervisor over channels.
//!
//! ```text
//! Supervisor Task (engine::Supervisor::run())
//! ├── Accept Task (incoming TCP)
//! ├── Dial Tasks (outbound TCP, one per attempt)
//! ├── LAN Beacon Task (UDP announce + listen)
//! ├── Peer 1 (reader task + writer task + upload tasks)
//! ├── Peer 2 (reader task + writer task + upload tasks)
//! ├── Resource Monitor Task (CPU sampling)
//! └── Persistence Writer Task (peer cache saves)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use swarmfetch_p2p::{DirStore, EngineConfig, EngineContext, P2pEngine};
//!
//! let config = EngineConfig::new("0.0.0.0:47821".parse().unwrap());
//! let store = Arc::new(DirStore::new("/var/lib/swarmfetch"));
//! let (engine, _task) = P2pEngine::spawn(config, EngineContext::new(store, key));
//! engine.start().await?;
//!
//! let stream = engine.request_file(&hash, size).await?;
//! ```

pub mod config;
pub mod error;

pub mod protocol;
pub mod peer;
pub mod manager;
pub mod discovery;
pub mod engine;
pub mod policy;
pub mod system;

pub mod store;
pub mod throttle;
pub mod traffic;
pub mod usage;

// Re-export main types
pub use config::{EngineConfig, MAX_FRAME_PAYLOAD, TRANSFER_SIZE_TOLERANCE};
pub use engine::{EngineContext, EngineSnapshot, EngineState, P2pEngine, P2pStream, PeerSnapshot};
pub use error::{ErrorClass, P2pError, P2pResult};
pub use peer::{PeerId, PeerIdentity};
pub use protocol::{Frame, MessageKind};
pub use store::{ContentStore, DirStore};
pub use system::{NodeAdapter, Profile, ResourceMonitor, ResourceSample, SystemTier};
pub use traffic::{DownloadActivity, TrafficState};
pub use usage::UsageTracker;
