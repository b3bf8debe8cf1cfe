//! Host-bound sealed blobs.
//!
//! Private on-disk state (the peer cache) is encrypted with a key derived
//! from host identity material, so a copied file is useless elsewhere.
//! Derivation and encryption are separate: a [`KeyDeriver`] turns a
//! [`HostIdentity`] into a key once, and the key is handed to whoever needs
//! to seal or open blobs.
//!
//! # Blob Format
//!
//! | Field      | Size (bytes) | Description                        |
//! |------------|--------------|------------------------------------|
//! | Magic      | 4            | "SWPC"                             |
//! | Version    | 1            | Format version (currently 1)       |
//! | Nonce      | 12           | Random nonce for AES-256-GCM       |
//! | Ciphertext | N + 16       | Encrypted payload + GCM tag        |

use std::fmt;
use std::path::Path;

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use argon2::{Argon2, Params, Version};
use rand::RngCore;

/// Magic bytes identifying a sealed blob.
pub const SEAL_MAGIC: &[u8; 4] = b"SWPC";

/// Current blob format version.
pub const SEAL_VERSION: u8 = 1;

/// Nonce size in bytes (for AES-GCM).
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Header size: magic + version + nonce.
pub const HEADER_SIZE: usize = 4 + 1 + NONCE_SIZE;

/// Application salt for host key derivation.
const HOST_KEY_SALT: &[u8] = b"swarmfetch.peer-cache.v1";

// Argon2id parameters. Derivation runs once per process.
const ARGON2_M_COST: u32 = 19 * 1024; // 19 MiB memory
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

/// Errors that can occur while sealing or opening a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    /// Blob is too short to contain a header and tag.
    TooShort {
        /// Minimum size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },
    /// Magic bytes don't match.
    InvalidMagic,
    /// Unsupported blob format version.
    UnsupportedVersion {
        /// The version number found in the blob.
        version: u8,
    },
    /// Key derivation failed.
    KeyDerivationFailed,
    /// Decryption failed (different host or corrupted data).
    DecryptionFailed,
    /// Encryption failed.
    EncryptionFailed,
}

impl fmt::Display for SealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SealError::TooShort { expected, actual } => {
                write!(f, "sealed blob too short: expected at least {} bytes, got {}", expected, actual)
            }
            SealError::InvalidMagic => write!(f, "not a sealed swarmfetch blob"),
            SealError::UnsupportedVersion { version } => {
                write!(f, "unsupported sealed blob version: {}", version)
            }
            SealError::KeyDerivationFailed => write!(f, "key derivation failed"),
            SealError::DecryptionFailed => {
                write!(f, "decryption failed (different host or corrupted blob)")
            }
            SealError::EncryptionFailed => write!(f, "encryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

/// Identity material of the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Machine host name.
    pub host_name: String,
    /// Login name of the running user.
    pub user_name: String,
    /// Application data directory.
    pub data_dir: String,
}

impl HostIdentity {
    /// Create identity material from explicit parts.
    pub fn new(host_name: impl Into<String>, user_name: impl Into<String>, data_dir: &Path) -> Self {
        Self {
            host_name: host_name.into(),
            user_name: user_name.into(),
            data_dir: data_dir.to_string_lossy().into_owned(),
        }
    }

    /// Canonical byte encoding fed into key derivation.
    fn material(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.host_name.len() + self.user_name.len() + self.data_dir.len() + 2,
        );
        out.extend_from_slice(self.host_name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.user_name.as_bytes());
        out.push(0);
        out.extend_from_slice(self.data_dir.as_bytes());
        out
    }
}

/// Derives symmetric keys from host identity material.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver;

impl KeyDeriver {
    /// Create a deriver with the default Argon2id parameters.
    pub fn new() -> Self {
        Self
    }

    /// Derive the 256-bit key for `identity`.
    pub fn derive(&self, identity: &HostIdentity) -> Result<[u8; 32], SealError> {
        let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
            .map_err(|_| SealError::KeyDerivationFailed)?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(&identity.material(), HOST_KEY_SALT, &mut key)
            .map_err(|_| SealError::KeyDerivationFailed)?;

        Ok(key)
    }
}

/// Encrypt `plaintext` into a sealed blob.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::EncryptionFailed)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    result.extend_from_slice(SEAL_MAGIC);
    result.push(SEAL_VERSION);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a sealed blob.
pub fn open_sealed(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, SealError> {
    if blob.len() < HEADER_SIZE + TAG_SIZE {
        return Err(SealError::TooShort {
            expected: HEADER_SIZE + TAG_SIZE,
            actual: blob.len(),
        });
    }

    if &blob[0..4] != SEAL_MAGIC {
        return Err(SealError::InvalidMagic);
    }

    let version = blob[4];
    if version != SEAL_VERSION {
        return Err(SealError::UnsupportedVersion { version });
    }

    let nonce_bytes = &blob[5..HEADER_SIZE];
    let ciphertext = &blob[HEADER_SIZE..];

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SealError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SealError::DecryptionFailed)
}
