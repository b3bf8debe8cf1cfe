//! Race error types.

use std::io;

use swarmfetch_core::{integrity_error, IntegrityError};
use thiserror::Error;

/// Errors from fetching an asset.
#[derive(Debug, Error)]
pub enum RaceError {
    /// Every source failed.
    #[error("Asset not found: {url}")]
    NotFound { url: String },

    /// HTTP request failed or returned a non-success status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Delivered bytes did not match the content hash.
    #[error("Integrity check failed: {0}")]
    Integrity(IntegrityError),

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for RaceError {
    fn from(err: io::Error) -> Self {
        match integrity_error(&err) {
            Some(integrity) => RaceError::Integrity(integrity.clone()),
            None => RaceError::Io(err),
        }
    }
}

impl From<reqwest::Error> for RaceError {
    fn from(err: reqwest::Error) -> Self {
        RaceError::Http(err.to_string())
    }
}

impl RaceError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, RaceError::Integrity(_))
    }
}

/// Result type for race operations.
pub type RaceResult<T> = Result<T, RaceError>;
