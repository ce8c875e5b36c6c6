//! Password database container
//!
//! Handles the encrypted file format:
//! - Plaintext file header and algorithm negotiation
//! - Recovery key blocks
//! - Authenticated, optionally compressed body
//! - Tagged field stream for entries and global settings

mod body;
mod codec;
mod container;
pub mod header;
pub mod models;
mod passw_db;
mod recovery;

pub use header::{Compression, FileHeader, InnerHeader};
pub use models::*;
pub use passw_db::{DbState, PasswDatabase};
