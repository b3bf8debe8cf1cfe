//! Error types for the swarmfetch core crate.

use std::fmt;

use crate::crypto::SealError;

/// Top-level error type for swarmfetch-core operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// A content identifier was malformed.
    ContentId(ContentIdError),
    /// A delivered stream did not match its content hash.
    Integrity(IntegrityError),
    /// Sealing or opening an encrypted blob failed.
    Seal(SealError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ContentId(e) => write!(f, "content id error: {}", e),
            CoreError::Integrity(e) => write!(f, "integrity error: {}", e),
            CoreError::Seal(e) => write!(f, "seal error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<ContentIdError> for CoreError {
    fn from(e: ContentIdError) -> Self {
        CoreError::ContentId(e)
    }
}

impl From<IntegrityError> for CoreError {
    fn from(e: IntegrityError) -> Self {
        CoreError::Integrity(e)
    }
}

impl From<SealError> for CoreError {
    fn from(e: SealError) -> Self {
        CoreError::Seal(e)
    }
}

/// Errors from parsing a content identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentIdError {
    /// Length is neither 32 (md5) nor 40 (sha1) characters.
    InvalidLength(usize),
    /// Contains a character outside `[0-9a-fA-F]`.
    NotHex,
}

impl fmt::Display for ContentIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentIdError::InvalidLength(len) => {
                write!(f, "content id must be 32 or 40 hex characters, got {}", len)
            }
            ContentIdError::NotHex => write!(f, "content id contains non-hex characters"),
        }
    }
}

impl std::error::Error for ContentIdError {}

/// A completed stream whose digest does not match the expected content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityError {
    /// The hash the stream was supposed to have.
    pub expected: String,
    /// The hash that was actually computed.
    pub actual: String,
    /// Number of bytes hashed.
    pub bytes: u64,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "digest mismatch after {} bytes: expected {}, got {}",
            self.bytes, self.expected, self.actual
        )
    }
}

impl std::error::Error for IntegrityError {}
