//! Cryptographic building blocks
//!
//! Ciphers, key derivation, HMAC helpers, key file handling and the startup
//! self-tests. Primitive implementations come from the RustCrypto crates.

mod cipher;
mod kdf;
mod keyfile;
mod mac;
mod selftest;

pub use cipher::{AES_BLOCK_SIZE, CHACHA20_IV_SIZE, CipherId, CipherSuite};
pub use kdf::{KEY_LENGTH, KdfId, pbkdf2_256bit, pbkdf2_256bit_cancellable};
pub use keyfile::{CompositeKey, KEY_FILE_HEX_SIZE, KEY_FILE_RAW_SIZE, key_from_bytes, key_from_file};
pub use mac::{
    Authenticator, HashId, SHA1_TAG_SIZE, hmac_sha1, hmac_sha256, verify_hmac_sha1,
};
pub use selftest::{ensure_self_tests, run_self_tests};

pub(crate) use kdf::derive_key;
