//! Bulk encryption cipher suite
//!
//! Two ciphers are supported end-to-end:
//! - AES-256-CBC with a 16-byte IV, data must be aligned to the block size
//! - ChaCha20 with an 8-byte IV (64-bit nonce), no alignment required
//!
//! Both are driven through the same `encrypt`/`decrypt` calls. Successive
//! calls continue the stream: CBC chains from the last ciphertext block and
//! ChaCha20 continues its keystream.

use aes::Aes256;
use block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{DbError, Result};

use super::KEY_LENGTH;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size
pub const AES_BLOCK_SIZE: usize = 16;

/// ChaCha20 IV size (64-bit nonce)
pub const CHACHA20_IV_SIZE: usize = 8;

/// Cipher identifier as stored in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherId {
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc = 0,
    #[serde(rename = "chacha20")]
    ChaCha20 = 1,
}

impl CipherId {
    /// Parse the on-disk identifier
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Aes256Cbc),
            1 => Some(Self::ChaCha20),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes256Cbc => "AES-256-CBC",
            Self::ChaCha20 => "ChaCha20",
        }
    }

    /// Block size in bytes (1 for stream ciphers)
    pub fn block_size(self) -> usize {
        match self {
            Self::Aes256Cbc => AES_BLOCK_SIZE,
            Self::ChaCha20 => 1,
        }
    }

    pub fn iv_size(self) -> usize {
        match self {
            Self::Aes256Cbc => AES_BLOCK_SIZE,
            Self::ChaCha20 => CHACHA20_IV_SIZE,
        }
    }

    pub fn is_stream_cipher(self) -> bool {
        matches!(self, Self::ChaCha20)
    }

    /// Round `len` up to a multiple of the block size
    pub fn align_to_block_size(self, len: usize) -> usize {
        let bs = self.block_size();
        len.div_ceil(bs) * bs
    }
}

enum CipherState {
    Aes256Cbc { iv: [u8; AES_BLOCK_SIZE] },
    ChaCha20(Box<ChaCha20Legacy>),
}

/// Keyed cipher instance
///
/// The IV must be set with [`CipherSuite::set_iv`] before the first call to
/// `encrypt` or `decrypt`.
pub struct CipherSuite {
    id: CipherId,
    key: Zeroizing<[u8; KEY_LENGTH]>,
    state: Option<CipherState>,
}

impl CipherSuite {
    pub fn new(id: CipherId, key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            id,
            key: Zeroizing::new(*key),
            state: None,
        }
    }

    pub fn id(&self) -> CipherId {
        self.id
    }

    pub fn block_size(&self) -> usize {
        self.id.block_size()
    }

    pub fn iv_size(&self) -> usize {
        self.id.iv_size()
    }

    pub fn is_stream_cipher(&self) -> bool {
        self.id.is_stream_cipher()
    }

    pub fn align_to_block_size(&self, len: usize) -> usize {
        self.id.align_to_block_size(len)
    }

    /// Reset the cipher to a new IV
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        if iv.len() != self.iv_size() {
            return Err(DbError::EncryptionError(format!(
                "{} requires a {}-byte IV, got {}",
                self.id.name(),
                self.iv_size(),
                iv.len()
            )));
        }

        self.state = Some(match self.id {
            CipherId::Aes256Cbc => {
                let mut block = [0u8; AES_BLOCK_SIZE];
                block.copy_from_slice(iv);
                CipherState::Aes256Cbc { iv: block }
            }
            CipherId::ChaCha20 => {
                let key: &[u8; KEY_LENGTH] = &self.key;
                let nonce: &[u8; CHACHA20_IV_SIZE] = iv
                    .try_into()
                    .map_err(|_| DbError::EncryptionError("invalid IV".to_string()))?;
                CipherState::ChaCha20(Box::new(ChaCha20Legacy::new(key.into(), nonce.into())))
            }
        });
        Ok(())
    }

    /// Encrypt `buf` in place
    pub fn encrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(buf.len())?;
        let key: &[u8; KEY_LENGTH] = &self.key;
        match self.state.as_mut() {
            None => Err(DbError::EncryptionError("IV not set".to_string())),
            Some(CipherState::Aes256Cbc { iv }) => {
                if buf.is_empty() {
                    return Ok(());
                }
                let len = buf.len();
                Aes256CbcEnc::new(key.into(), (&*iv).into())
                    .encrypt_padded_mut::<NoPadding>(buf, len)
                    .map_err(|e| DbError::EncryptionError(format!("Encryption failed: {:?}", e)))?;
                iv.copy_from_slice(&buf[len - AES_BLOCK_SIZE..]);
                Ok(())
            }
            Some(CipherState::ChaCha20(stream)) => {
                stream.apply_keystream(buf);
                Ok(())
            }
        }
    }

    /// Decrypt `buf` in place
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(buf.len())?;
        let key: &[u8; KEY_LENGTH] = &self.key;
        match self.state.as_mut() {
            None => Err(DbError::EncryptionError("IV not set".to_string())),
            Some(CipherState::Aes256Cbc { iv }) => {
                if buf.is_empty() {
                    return Ok(());
                }
                let len = buf.len();
                let mut next_iv = [0u8; AES_BLOCK_SIZE];
                next_iv.copy_from_slice(&buf[len - AES_BLOCK_SIZE..]);
                Aes256CbcDec::new(key.into(), (&*iv).into())
                    .decrypt_padded_mut::<NoPadding>(buf)
                    .map_err(|e| DbError::EncryptionError(format!("Decryption failed: {:?}", e)))?;
                *iv = next_iv;
                Ok(())
            }
            Some(CipherState::ChaCha20(stream)) => {
                stream.apply_keystream(buf);
                Ok(())
            }
        }
    }

    fn check_alignment(&self, len: usize) -> Result<()> {
        if len % self.block_size() != 0 {
            return Err(DbError::EncryptionError(format!(
                "{} data length {} is not a multiple of {}",
                self.id.name(),
                len,
                self.block_size()
            )));
        }
        Ok(())
    }
}

impl Drop for CipherSuite {
    fn drop(&mut self) {
        if let Some(CipherState::Aes256Cbc { iv }) = self.state.as_mut() {
            iv.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn test_cipher_id_parse() {
        assert_eq!(CipherId::from_u8(0), Some(CipherId::Aes256Cbc));
        assert_eq!(CipherId::from_u8(1), Some(CipherId::ChaCha20));
        assert_eq!(CipherId::from_u8(7), None);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(CipherId::Aes256Cbc.iv_size(), 16);
        assert_eq!(CipherId::ChaCha20.iv_size(), 8);
        assert!(CipherId::ChaCha20.is_stream_cipher());
        assert!(!CipherId::Aes256Cbc.is_stream_cipher());
        assert_eq!(CipherId::Aes256Cbc.align_to_block_size(0), 0);
        assert_eq!(CipherId::Aes256Cbc.align_to_block_size(1), 16);
        assert_eq!(CipherId::Aes256Cbc.align_to_block_size(32), 32);
        assert_eq!(CipherId::ChaCha20.align_to_block_size(33), 33);
    }

    #[test]
    fn test_encrypt_without_iv_fails() {
        let mut suite = CipherSuite::new(CipherId::ChaCha20, &KEY);
        let mut buf = [0u8; 8];
        assert!(suite.encrypt(&mut buf).is_err());
    }

    #[test]
    fn test_wrong_iv_size_rejected() {
        let mut suite = CipherSuite::new(CipherId::Aes256Cbc, &KEY);
        assert!(suite.set_iv(&[0u8; 8]).is_err());
        let mut suite = CipherSuite::new(CipherId::ChaCha20, &KEY);
        assert!(suite.set_iv(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_cbc_rejects_unaligned() {
        let mut suite = CipherSuite::new(CipherId::Aes256Cbc, &KEY);
        suite.set_iv(&[0u8; 16]).unwrap();
        let mut buf = [0u8; 17];
        assert!(suite.encrypt(&mut buf).is_err());
    }

    #[test]
    fn test_roundtrip_both_ciphers() {
        for id in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
            let iv = vec![9u8; id.iv_size()];
            let plain = b"0123456789abcdef0123456789abcdef".to_vec();

            let mut enc = CipherSuite::new(id, &KEY);
            enc.set_iv(&iv).unwrap();
            let mut buf = plain.clone();
            enc.encrypt(&mut buf).unwrap();
            assert_ne!(buf, plain);

            let mut dec = CipherSuite::new(id, &KEY);
            dec.set_iv(&iv).unwrap();
            dec.decrypt(&mut buf).unwrap();
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn test_chained_calls_match_single_call() {
        for id in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
            let iv = vec![3u8; id.iv_size()];
            let data: Vec<u8> = (0..64u8).collect();

            let mut whole = CipherSuite::new(id, &KEY);
            whole.set_iv(&iv).unwrap();
            let mut one = data.clone();
            whole.encrypt(&mut one).unwrap();

            let mut parts = CipherSuite::new(id, &KEY);
            parts.set_iv(&iv).unwrap();
            let mut two = data.clone();
            let (a, b) = two.split_at_mut(32);
            parts.encrypt(a).unwrap();
            parts.encrypt(b).unwrap();

            assert_eq!(one, two, "{} chaining", id.name());
        }
    }
}
