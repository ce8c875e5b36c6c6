//! Keystream primitives behind the random pool generator

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha8, ChaCha20};
use serde::{Deserialize, Serialize};

use crate::crypto::KEY_LENGTH;

/// Size of the generator counter in bytes
pub const COUNTER_SIZE: usize = 16;

/// Bytes produced per ChaCha block
const CHACHA_BLOCK_SIZE: u64 = 64;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Keystream primitive used by [`RandomPool`](super::RandomPool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolCipher {
    AesCtr,
    #[default]
    #[serde(rename = "chacha20")]
    ChaCha20,
    #[serde(rename = "chacha8")]
    ChaCha8,
}

impl PoolCipher {
    pub fn name(self) -> &'static str {
        match self {
            Self::AesCtr => "AES-256-CTR",
            Self::ChaCha20 => "ChaCha20",
            Self::ChaCha8 => "ChaCha8",
        }
    }

    /// Keyed one-block transform `E_K(block)`
    ///
    /// AES encrypts the block directly. The ChaCha variants treat the block
    /// as a (position, nonce) pair and XOR it with the keystream found there.
    pub(crate) fn encrypt_block(
        self,
        key: &[u8; KEY_LENGTH],
        block: &[u8; COUNTER_SIZE],
    ) -> [u8; COUNTER_SIZE] {
        match self {
            Self::AesCtr => {
                let cipher = Aes256::new(key.into());
                let mut out = aes::Block::from(*block);
                cipher.encrypt_block(&mut out);
                out.into()
            }
            Self::ChaCha20 => {
                let mut stream = ChaCha20::new(key.into(), (&chacha_nonce(block)).into());
                chacha_block(&mut stream, block)
            }
            Self::ChaCha8 => {
                let mut stream = ChaCha8::new(key.into(), (&chacha_nonce(block)).into());
                chacha_block(&mut stream, block)
            }
        }
    }

    /// Overwrite `out` with keystream for `(key, counter)`
    pub(crate) fn keystream(
        self,
        key: &[u8; KEY_LENGTH],
        counter: &[u8; COUNTER_SIZE],
        out: &mut [u8],
    ) {
        out.fill(0);
        match self {
            Self::AesCtr => Aes256Ctr::new(key.into(), counter.into()).apply_keystream(out),
            Self::ChaCha20 => {
                ChaCha20::new(key.into(), (&chacha_nonce(counter)).into()).apply_keystream(out)
            }
            Self::ChaCha8 => {
                ChaCha8::new(key.into(), (&chacha_nonce(counter)).into()).apply_keystream(out)
            }
        }
    }

    /// How far the counter advances after producing `len` bytes
    pub(crate) fn counter_steps(self, len: usize) -> u128 {
        match self {
            Self::AesCtr => len.div_ceil(COUNTER_SIZE) as u128,
            // every call uses a fresh nonce
            Self::ChaCha20 | Self::ChaCha8 => 1,
        }
    }
}

fn chacha_nonce(block: &[u8; COUNTER_SIZE]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&block[4..]);
    nonce
}

fn chacha_block<S: StreamCipher + StreamCipherSeek>(
    stream: &mut S,
    block: &[u8; COUNTER_SIZE],
) -> [u8; COUNTER_SIZE] {
    let position = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    stream.seek(u64::from(position) * CHACHA_BLOCK_SIZE);
    let mut out = *block;
    stream.apply_keystream(&mut out);
    out
}

/// Add `steps` to a big-endian 128-bit counter
pub(crate) fn increment_counter(counter: &mut [u8; COUNTER_SIZE], steps: u128) {
    let value = u128::from_be_bytes(*counter).wrapping_add(steps);
    *counter = value.to_be_bytes();
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PoolCipher; 3] = [PoolCipher::AesCtr, PoolCipher::ChaCha20, PoolCipher::ChaCha8];

    #[test]
    fn test_default_is_chacha20() {
        assert_eq!(PoolCipher::default(), PoolCipher::ChaCha20);
    }

    #[test]
    fn test_encrypt_block_is_keyed() {
        for cipher in ALL {
            let block = [7u8; COUNTER_SIZE];
            let a = cipher.encrypt_block(&[1u8; 32], &block);
            let b = cipher.encrypt_block(&[2u8; 32], &block);
            assert_ne!(a, b, "{}", cipher.name());
            assert_eq!(a, cipher.encrypt_block(&[1u8; 32], &block));
        }
    }

    #[test]
    fn test_aes_block_known_answer() {
        // FIPS-197 C.3
        let key: [u8; 32] = core::array::from_fn(|i| i as u8);
        let block: [u8; 16] = core::array::from_fn(|i| (i as u8) * 0x11);
        let out = PoolCipher::AesCtr.encrypt_block(&key, &block);
        assert_eq!(hex::encode(out), "8ea2b7ca516745bfeafc49904b496089");
    }

    #[test]
    fn test_keystream_depends_on_counter() {
        for cipher in ALL {
            let key = [3u8; 32];
            let mut counter = [0u8; COUNTER_SIZE];
            let mut a = [0u8; 48];
            cipher.keystream(&key, &counter, &mut a);
            increment_counter(&mut counter, cipher.counter_steps(a.len()));
            let mut b = [0u8; 48];
            cipher.keystream(&key, &counter, &mut b);
            assert_ne!(a, b, "{}", cipher.name());
        }
    }

    #[test]
    fn test_keystream_overwrites_buffer() {
        let mut a = [0xffu8; 32];
        let mut b = [0x00u8; 32];
        PoolCipher::ChaCha20.keystream(&[9u8; 32], &[1u8; 16], &mut a);
        PoolCipher::ChaCha20.keystream(&[9u8; 32], &[1u8; 16], &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_counter_steps() {
        assert_eq!(PoolCipher::AesCtr.counter_steps(64), 4);
        assert_eq!(PoolCipher::AesCtr.counter_steps(65), 5);
        assert_eq!(PoolCipher::ChaCha8.counter_steps(1000), 1);
    }

    #[test]
    fn test_increment_counter_carries() {
        let mut counter = [0u8; COUNTER_SIZE];
        counter[15] = 0xff;
        increment_counter(&mut counter, 1);
        assert_eq!(counter[14], 1);
        assert_eq!(counter[15], 0);

        let mut counter = [0xffu8; COUNTER_SIZE];
        increment_counter(&mut counter, 1);
        assert_eq!(counter, [0u8; COUNTER_SIZE]);
    }
}
