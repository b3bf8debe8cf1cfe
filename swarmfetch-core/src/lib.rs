//! # Swarmfetch Core
//!
//! Foundation types shared by the swarmfetch crates:
//! - Content identifiers (md5 / sha1 hex digests) and URL hash extraction
//! - The fixed swarm rendezvous topic
//! - Streaming digest verification for untrusted byte streams
//! - Host-bound key derivation and sealed blobs (Argon2id + AES-256-GCM)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod content;
pub mod crypto;
pub mod error;
pub mod verify;

// Re-export commonly used types at crate root
pub use content::{extract_content_hash, ContentHash, HashAlgorithm, SwarmTopic, SWARM_TOPIC_SEED};
pub use crypto::{open_sealed, seal, sha256, HostIdentity, KeyDeriver, SealError, StreamingHasher};
pub use error::{ContentIdError, CoreError, IntegrityError};
pub use verify::{integrity_error, verify_bytes, ByteStream, HashVerifierStream};
