//! Cryptographic primitives for swarmfetch.
//!
//! This module provides:
//! - SHA-256 hashing (swarm topic, identities)
//! - Incremental md5/sha1 hashing for content verification
//! - Host-bound key derivation (Argon2id)
//! - Sealed blob format (AES-256-GCM) for private on-disk state

mod hashing;
pub mod seal;

pub use hashing::{sha256, StreamingHasher};
pub use seal::{open_sealed, seal, HostIdentity, KeyDeriver, SealError};
