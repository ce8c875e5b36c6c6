//! Secret-holding memory
//!
//! Locked buffers for key material and the sealed in-memory password cache.

mod cache;
mod locked;

pub use cache::{PasswordCache, SealedPassword};
pub use locked::SecureBuffer;
