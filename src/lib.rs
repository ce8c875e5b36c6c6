//! # pwcore
//!
//! Security kernel of a password manager: an encrypted single-file password
//! database together with the randomness and key material it depends on.
//!
//! ## Features
//!
//! - AES-256-CBC or ChaCha20 bulk encryption, HMAC-SHA-256/512 authentication
//! - PBKDF2-HMAC-SHA-256 key derivation with a cancellable variant
//! - Optional recovery key unlocking the same master key
//! - Passphrase and key file composite keys
//! - Entropy pool CSPRNG with seed file persistence
//! - Per-entry passwords sealed in locked memory
//! - DEFLATE-compressed, versioned container format
//! - CSV and JSON export
//!
//! ## Example
//!
//! ```no_run
//! use pwcore::{CompositeKey, PasswDatabase, PasswDbEntry, PoolCipher, PoolHandle};
//! use std::path::Path;
//!
//! let pool = PoolHandle::new(PoolCipher::default()).unwrap();
//! let mut db = PasswDatabase::new(pool);
//! db.create(&CompositeKey::from_passphrase("correct horse")).unwrap();
//!
//! let index = db.add_entry(PasswDbEntry::new("bank", "alice")).unwrap();
//! db.set_db_entry_passw(index, "p@ss").unwrap();
//! db.save_to_file(Path::new("/path/to/passwords.pwdb")).unwrap();
//! ```

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod export;
pub mod memory;
pub mod random;
pub mod utils;

// Re-export main types
pub use config::DbConfig;
pub use crypto::{CipherId, CompositeKey, HashId, KdfId, pbkdf2_256bit};
pub use database::{DbDefaults, DbState, ExpiryDate, FieldId, PasswDatabase, PasswDbEntry, PasswHistory};
pub use error::{DbError, ErrorKind, Result};
pub use export::{CsvExportOptions, ExportEntry, export_csv};
pub use random::{EntropyManager, EntropySource, PoolCipher, PoolHandle, RandomPool};

/// File magic
pub const MAGIC: &[u8; 4] = b"PWdb";

/// Format version written by this library
pub const FORMAT_VERSION: u16 = 0x104;

/// Default PBKDF2 iteration count
pub const KDF_ITERATIONS_DEFAULT: u32 = 16384;

/// Maximum database file size in bytes
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Size of the database and key block salts
pub const SALT_SIZE: usize = 32;
