//! Error types for the password database core

use thiserror::Error;

/// Main error type for database and random pool operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Structural violation: bad magic, truncated field, unsupported ids, inconsistent lengths
    #[error("Invalid database format: {0}")]
    InvalidFormat(String),

    /// Wrong key or corrupted database; both causes share one message
    #[error("Invalid key or corrupted database")]
    InvalidKey,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File exceeds the maximum supported size
    #[error("File too large: {0} bytes")]
    FileTooLarge(u64),

    /// Key file could not be used
    #[error("Key file error: {0}")]
    KeyFile(String),

    /// Database is not open
    #[error("Database is not open")]
    NotOpen,

    /// Entry index out of range
    #[error("Entry not found: {0}")]
    EntryNotFound(usize),

    /// A cancellable operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Cryptographic known-answer test failed at startup
    #[error("Cryptographic self-test failed: {0}")]
    SelfTestFailed(&'static str),

    /// Authentication tag of a cached secret did not match
    #[error("Password cache corrupted for entry {0}")]
    CacheCorrupted(u32),

    /// Encryption or decryption failed
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Coarse classification used by callers to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File rejected wholesale
    InvalidFormat,
    /// Wrong key or tampered file
    InvalidKey,
    /// File system problem, operation aborted
    Io,
    /// Unrecoverable, the crypto core must not be used any further
    Fatal,
    /// Caller misuse (closed database, bad index, cancelled, bad config)
    Usage,
}

impl DbError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::InvalidKey => ErrorKind::InvalidKey,
            Self::Io(_) | Self::FileTooLarge(_) | Self::KeyFile(_) => ErrorKind::Io,
            Self::SelfTestFailed(_) | Self::CacheCorrupted(_) | Self::EncryptionError(_) => {
                ErrorKind::Fatal
            }
            Self::NotOpen
            | Self::EntryNotFound(_)
            | Self::Cancelled
            | Self::Config(_)
            | Self::InvalidOperation(_) => ErrorKind::Usage,
        }
    }

    /// True if the process must stop using the crypto core
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Config(err.to_string())
    }
}

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DbError>;
