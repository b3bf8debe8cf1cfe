//! Connection management: peer registry, outbound dialling and the
//! inbound listener.

pub mod inbound;
pub mod outbound;
pub mod registry;

pub use inbound::InboundListener;
pub use outbound::{connect_to_peer, ConnectResult};
pub use registry::PeerRegistry;
