//! Wire protocol.
//!
//! This module contains:
//! - Frame and payload definitions for the eight message kinds
//! - The binary framing codec
//! - HELLO exchange and RTT tracking

pub mod framing;
pub mod handshake;
pub mod messages;

pub use framing::FrameCodec;
pub use handshake::Handshake;
pub use messages::{
    reasons, BatchEntry, BatchRequest, Frame, Hello, MessageKind, RequestPayload, SafePath,
};
