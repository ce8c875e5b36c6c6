//! Key files and composite keys
//!
//! A key file contributes 32 bytes to the database key:
//! 1. exactly 32 bytes: used as-is
//! 2. exactly 64 hex digits: decoded to 32 bytes
//! 3. anything else: SHA-256 of the whole file
//!
//! The composite key is the passphrase bytes followed by the key file bytes.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{DbError, Result};
use crate::MAX_FILE_SIZE;

use super::KEY_LENGTH;

/// Raw key file size
pub const KEY_FILE_RAW_SIZE: usize = KEY_LENGTH;

/// Hex key file size
pub const KEY_FILE_HEX_SIZE: usize = KEY_LENGTH * 2;

/// Read a key file and turn it into 32 bytes of key material
pub fn key_from_file(path: &Path) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let meta = fs::metadata(path)
        .map_err(|e| DbError::KeyFile(format!("{}: {}", path.display(), e)))?;

    if meta.len() > MAX_FILE_SIZE {
        return Err(DbError::FileTooLarge(meta.len()));
    }

    let data = Zeroizing::new(
        fs::read(path).map_err(|e| DbError::KeyFile(format!("{}: {}", path.display(), e)))?,
    );

    Ok(key_from_bytes(&data))
}

/// Turn key file contents into 32 bytes of key material
pub fn key_from_bytes(data: &[u8]) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);

    if data.len() == KEY_FILE_RAW_SIZE {
        key.copy_from_slice(data);
        return key;
    }

    if data.len() == KEY_FILE_HEX_SIZE && hex::decode_to_slice(data, &mut key[..]).is_ok() {
        return key;
    }

    let digest = Sha256::digest(data);
    key.copy_from_slice(&digest);
    key
}

/// Passphrase and/or key file material fed to the KDF
pub struct CompositeKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl CompositeKey {
    /// Build a key from an optional passphrase and an optional key file
    ///
    /// At least one of the two must be supplied.
    pub fn new(passphrase: Option<&str>, key_file: Option<&Path>) -> Result<Self> {
        let file_key = key_file.map(key_from_file).transpose()?;
        Self::from_parts(
            passphrase.map(str::as_bytes),
            file_key.as_ref().map(|k| &k[..]),
        )
    }

    /// Passphrase-only key
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            bytes: Zeroizing::new(passphrase.as_bytes().to_vec()),
        }
    }

    /// Build a key from raw passphrase bytes and already-processed key file bytes
    pub fn from_parts(passphrase: Option<&[u8]>, key_file_key: Option<&[u8]>) -> Result<Self> {
        if passphrase.is_none() && key_file_key.is_none() {
            return Err(DbError::InvalidOperation(
                "a passphrase or a key file is required".to_string(),
            ));
        }

        let mut bytes = Zeroizing::new(Vec::new());
        if let Some(p) = passphrase {
            bytes.extend_from_slice(p);
        }
        if let Some(k) = key_file_key {
            bytes.extend_from_slice(k);
        }
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKey").finish_non_exhaustive()
    }
}
