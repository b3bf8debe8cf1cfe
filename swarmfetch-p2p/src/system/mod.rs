//! Local machine awareness: hardware tier, resource load and network identity.

pub mod adapter;
pub mod monitor;
pub mod network;

pub use adapter::{NodeAdapter, Profile, SystemTier, MAX_WEIGHT};
pub use monitor::{CpuProbe, ResourceMonitor, ResourceSample, SysinfoProbe};
pub use network::{is_lan_peer, network_fingerprint, InterfaceProbe, SystemInterfaceProbe};
