//! Content identifiers and the swarm rendezvous topic.
//!
//! Assets are addressed by their md5 (32 hex chars) or sha1 (40 hex chars)
//! digest. The same string identifies the file on the wire and verifies it
//! on receipt.

use std::fmt;
use std::str::FromStr;

use crate::crypto::sha256;
use crate::error::ContentIdError;

/// Seed string hashed into the fixed swarm topic.
pub const SWARM_TOPIC_SEED: &str = "swarmfetch/asset-swarm/v1";

/// Digest algorithm implied by a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// 128-bit md5, 32 hex characters.
    Md5,
    /// 160-bit sha1, 40 hex characters.
    Sha1,
}

impl HashAlgorithm {
    /// Infer the algorithm from a hex digest length.
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(HashAlgorithm::Md5),
            40 => Some(HashAlgorithm::Sha1),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
        }
    }
}

/// A validated, lower-cased md5 or sha1 hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse and validate a content hash.
    pub fn parse(s: &str) -> Result<Self, ContentIdError> {
        if HashAlgorithm::from_hex_len(s.len()).is_none() {
            return Err(ContentIdError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContentIdError::NotHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// The algorithm implied by the hash length.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self.0.len() {
            32 => HashAlgorithm::Md5,
            _ => HashAlgorithm::Sha1,
        }
    }

    /// The hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes of the hex string, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The first two hex characters, used for object fan-out directories.
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl FromStr for ContentHash {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Find the content hash embedded in a URL.
///
/// Scans for maximal runs of hex characters and returns the last run that is
/// exactly 32 or 40 characters long. Runs of other lengths are ignored, so a
/// 64-character sha256 never yields a truncated match.
pub fn extract_content_hash(url: &str) -> Option<ContentHash> {
    let bytes = url.as_bytes();
    let mut found = None;
    let mut start = None;

    for i in 0..=bytes.len() {
        let is_hex = i < bytes.len() && bytes[i].is_ascii_hexdigit();
        match (is_hex, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if HashAlgorithm::from_hex_len(i - s).is_some() {
                    found = Some(s..i);
                }
                start = None;
            }
            _ => {}
        }
    }

    found.and_then(|range| ContentHash::parse(&url[range]).ok())
}

/// The fixed 32-byte rendezvous namespace every node joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwarmTopic([u8; 32]);

impl SwarmTopic {
    /// The topic derived from [`SWARM_TOPIC_SEED`].
    pub fn fixed() -> Self {
        Self(sha256(SWARM_TOPIC_SEED.as_bytes()))
    }

    /// Topic bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SwarmTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
