//! Hashing utilities.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::content::HashAlgorithm;

/// Compute SHA-256 hash of the input data.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental digest for one of the content hash algorithms.
#[derive(Clone)]
pub enum StreamingHasher {
    /// md5 state.
    Md5(Md5),
    /// sha1 state.
    Sha1(Sha1),
}

impl StreamingHasher {
    /// Start a new digest for `algorithm`.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => StreamingHasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => StreamingHasher::Sha1(Sha1::new()),
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingHasher::Md5(h) => h.update(data),
            StreamingHasher::Sha1(h) => h.update(data),
        }
    }

    /// Finish and return the lower-case hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Md5(h) => hex::encode(h.finalize()),
            StreamingHasher::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

impl std::fmt::Debug for StreamingHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingHasher::Md5(_) => write!(f, "StreamingHasher(md5)"),
            StreamingHasher::Sha1(_) => write!(f, "StreamingHasher(sha1)"),
        }
    }
}
