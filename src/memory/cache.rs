//! In-memory password cache
//!
//! Entry passwords are never kept in plaintext. Each one is sealed with a
//! process-local ChaCha20 key (independent of the database master key) under
//! a nonce made from the entry id and a sealing sequence number. An
//! HMAC-SHA-1 over the plaintext detects corruption of the sealed value.

use chacha20::ChaCha20Legacy;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use tracing::error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{CHACHA20_IV_SIZE, KEY_LENGTH, SHA1_TAG_SIZE, hmac_sha1, verify_hmac_sha1};
use crate::error::{DbError, Result};
use crate::random::RandomPool;

use super::locked::SecureBuffer;

/// A sealed password as stored inside an entry
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealedPassword {
    ciphertext: Vec<u8>,
    tag: [u8; SHA1_TAG_SIZE],
    seq: u32,
}

impl SealedPassword {
    /// Length of the sealed plaintext in bytes
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl std::fmt::Debug for SealedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedPassword")
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Process-local sealing keys for entry passwords
pub struct PasswordCache {
    cipher_key: SecureBuffer<KEY_LENGTH>,
    mac_key: SecureBuffer<KEY_LENGTH>,
    next_seq: u32,
}

impl PasswordCache {
    /// Create a cache with fresh keys drawn from `pool`
    pub fn new(pool: &mut RandomPool) -> Self {
        let mut cipher_key = SecureBuffer::new();
        let mut mac_key = SecureBuffer::new();
        pool.get_data(cipher_key.as_mut_bytes());
        pool.get_data(mac_key.as_mut_bytes());
        Self {
            cipher_key,
            mac_key,
            next_seq: 0,
        }
    }

    fn keystream(&self, entry_id: u32, seq: u32, buf: &mut [u8]) {
        let mut nonce = [0u8; CHACHA20_IV_SIZE];
        nonce[..4].copy_from_slice(&entry_id.to_le_bytes());
        nonce[4..].copy_from_slice(&seq.to_le_bytes());
        let mut stream = ChaCha20Legacy::new(self.cipher_key.as_bytes().into(), (&nonce).into());
        stream.apply_keystream(buf);
    }

    /// Seal `passw` for the entry with `entry_id`
    ///
    /// Each `(entry_id, seq)` nonce is used at most once; sealing fails
    /// when the sequence runs out.
    pub fn seal(&mut self, entry_id: u32, passw: &str) -> Result<SealedPassword> {
        let seq = self.next_seq;
        self.next_seq = seq
            .checked_add(1)
            .ok_or_else(|| DbError::InvalidOperation("password cache sequence exhausted".to_string()))?;

        let tag = hmac_sha1(self.mac_key.as_bytes(), passw.as_bytes());
        let mut ciphertext = passw.as_bytes().to_vec();
        self.keystream(entry_id, seq, &mut ciphertext);

        Ok(SealedPassword { ciphertext, tag, seq })
    }

    /// Recover the plaintext of a sealed password
    ///
    /// A tag mismatch means the cache memory was corrupted or tampered with;
    /// the error is fatal.
    pub fn open(&self, entry_id: u32, sealed: &SealedPassword) -> Result<Zeroizing<String>> {
        let mut plain = Zeroizing::new(sealed.ciphertext.clone());
        self.keystream(entry_id, sealed.seq, &mut plain);

        if !verify_hmac_sha1(self.mac_key.as_bytes(), &plain, &sealed.tag) {
            error!(entry_id, "password cache authentication failed");
            return Err(DbError::CacheCorrupted(entry_id));
        }

        match String::from_utf8(std::mem::take(&mut *plain)) {
            Ok(text) => Ok(Zeroizing::new(text)),
            Err(e) => {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                error!(entry_id, "password cache holds invalid UTF-8");
                Err(DbError::CacheCorrupted(entry_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PasswordCache {
        let mut pool = RandomPool::new(Default::default()).unwrap();
        PasswordCache::new(&mut pool)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let mut cache = cache();
        let sealed = cache.seal(7, "p@ss wörd").unwrap();
        assert_eq!(&*cache.open(7, &sealed).unwrap(), "p@ss wörd");
    }

    #[test]
    fn test_sealed_is_not_plaintext() {
        let mut cache = cache();
        let sealed = cache.seal(1, "plaintext-password").unwrap();
        assert_ne!(sealed.ciphertext, b"plaintext-password".to_vec());
        assert_eq!(sealed.len(), "plaintext-password".len());
    }

    #[test]
    fn test_same_password_seals_differently() {
        let mut cache = cache();
        let a = cache.seal(1, "same").unwrap();
        let b = cache.seal(1, "same").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_corruption_is_fatal() {
        let mut cache = cache();
        let mut sealed = cache.seal(3, "secret").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        let err = cache.open(3, &sealed).unwrap_err();
        assert!(matches!(err, DbError::CacheCorrupted(3)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wrong_entry_id_detected() {
        let mut cache = cache();
        let sealed = cache.seal(3, "secret").unwrap();
        assert!(cache.open(4, &sealed).is_err());
    }

    #[test]
    fn test_other_cache_cannot_open() {
        let mut a = cache();
        let b = cache();
        let sealed = a.seal(1, "secret").unwrap();
        assert!(b.open(1, &sealed).is_err());
    }

    #[test]
    fn test_empty_password() {
        let mut cache = cache();
        let sealed = cache.seal(9, "").unwrap();
        assert!(sealed.is_empty());
        assert_eq!(&*cache.open(9, &sealed).unwrap(), "");
    }

    #[test]
    fn test_sequence_exhaustion_refused() {
        let mut cache = cache();
        cache.next_seq = u32::MAX - 1;
        let sealed = cache.seal(2, "last").unwrap();
        assert_eq!(&*cache.open(2, &sealed).unwrap(), "last");
        assert!(matches!(cache.seal(2, "again"), Err(DbError::InvalidOperation(_))));
    }
}
