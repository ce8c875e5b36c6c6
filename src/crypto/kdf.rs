//! Key derivation
//!
//! PBKDF2-HMAC-SHA-256 with a fixed 256-bit output. The iteration count is
//! chosen by the caller and persisted per database.
//!
//! Two entry points exist: [`pbkdf2_256bit`] for plain derivation and
//! [`pbkdf2_256bit_cancellable`] which polls a cancel flag on every iteration
//! so a long master-key change can be aborted from another thread.

use std::sync::atomic::{AtomicBool, Ordering};

use hmac::Mac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{DbError, Result};

use super::mac::HmacSha256;

/// Key length for the master key and all derived keys (32 bytes = 256 bits)
pub const KEY_LENGTH: usize = 32;

/// Key derivation function identifier as stored in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfId {
    Pbkdf2Sha256 = 0,
}

impl KdfId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pbkdf2Sha256),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Derive a 256-bit key from `password` and `salt`
///
/// # Arguments
///
/// * `password` - Raw key bytes (passphrase and/or key file material)
/// * `salt` - Per-database salt
/// * `iterations` - PBKDF2 iteration count, values below 1 are treated as 1
pub fn pbkdf2_256bit(password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut *key);
    key
}

/// Same as [`pbkdf2_256bit`], aborting with [`DbError::Cancelled`] as soon as
/// `cancel` is set
pub fn pbkdf2_256bit_cancellable(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    cancel: &AtomicBool,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let prf = <HmacSha256 as Mac>::new_from_slice(password)
        .map_err(|e| DbError::EncryptionError(e.to_string()))?;

    // a 256-bit output is exactly one PBKDF2 block, index 1
    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; KEY_LENGTH] = mac.finalize().into_bytes().into();
    let mut key = Zeroizing::new(u);

    for _ in 1..iterations.max(1) {
        if cancel.load(Ordering::Relaxed) {
            u.zeroize();
            return Err(DbError::Cancelled);
        }
        let mut mac = prf.clone();
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (k, b) in key.iter_mut().zip(u.iter()) {
            *k ^= b;
        }
    }

    u.zeroize();
    Ok(key)
}

/// Derive with the optional cancel flag
pub(crate) fn derive_key(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    cancel: Option<&AtomicBool>,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    match cancel {
        Some(flag) => pbkdf2_256bit_cancellable(password, salt, iterations, flag),
        None => Ok(pbkdf2_256bit(password, salt, iterations)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_known_answer_one_iteration() {
        let key = pbkdf2_256bit(b"password", b"salt", 1);
        assert_eq!(
            hex::encode(*key),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn test_pbkdf2_known_answer_two_iterations() {
        let key = pbkdf2_256bit(b"password", b"salt", 2);
        assert_eq!(
            hex::encode(*key),
            "ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43"
        );
    }

    #[test]
    fn test_cancellable_matches_plain() {
        let flag = AtomicBool::new(false);
        for iterations in [1, 2, 17, 1000] {
            let plain = pbkdf2_256bit(b"correct horse", b"battery staple", iterations);
            let polled =
                pbkdf2_256bit_cancellable(b"correct horse", b"battery staple", iterations, &flag)
                    .unwrap();
            assert_eq!(*plain, *polled, "iterations = {}", iterations);
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let flag = AtomicBool::new(true);
        let result = pbkdf2_256bit_cancellable(b"pw", b"salt", 100, &flag);
        assert!(matches!(result, Err(DbError::Cancelled)));
    }

    #[test]
    fn test_iterations_change_output() {
        let a = pbkdf2_256bit(b"pw", b"salt", 1000);
        let b = pbkdf2_256bit(b"pw", b"salt", 1001);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_zero_iterations_treated_as_one() {
        assert_eq!(*pbkdf2_256bit(b"pw", b"s", 0), *pbkdf2_256bit(b"pw", b"s", 1));
    }

    #[test]
    fn test_kdf_id_parse() {
        assert_eq!(KdfId::from_u8(0), Some(KdfId::Pbkdf2Sha256));
        assert_eq!(KdfId::from_u8(1), None);
    }
}
