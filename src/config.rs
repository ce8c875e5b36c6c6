//! Database configuration
//!
//! Algorithms and parameters used when a database is created or saved. Read
//! from JSON; missing fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::KDF_ITERATIONS_DEFAULT;
use crate::crypto::{CipherId, HashId};
use crate::error::{DbError, Result};
use crate::random::PoolCipher;

/// Default DEFLATE level
pub const COMPRESSION_LEVEL_DEFAULT: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Bulk cipher for new databases
    pub cipher: CipherId,
    /// Hash for the file authentication tag
    pub hash: HashId,
    /// PBKDF2 iterations for new databases
    pub kdf_iterations: u32,
    /// DEFLATE level 0-9, `None` to store the payload uncompressed
    pub compression_level: Option<u8>,
    /// Keystream primitive of the random pool
    pub pool_cipher: PoolCipher,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            cipher: CipherId::Aes256Cbc,
            hash: HashId::Sha512,
            kdf_iterations: KDF_ITERATIONS_DEFAULT,
            compression_level: Some(COMPRESSION_LEVEL_DEFAULT),
            pool_cipher: PoolCipher::default(),
        }
    }
}

impl DbConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(DbError::Config("kdf_iterations must be at least 1".to_string()));
        }
        match self.compression_level {
            Some(level) if level > 9 => Err(DbError::Config(format!(
                "compression_level must be 0-9, got {}",
                level
            ))),
            _ => Ok(()),
        }
    }
}
