//! Entropy pool and generator-gate CSPRNG
//!
//! Input is collected in an accumulation buffer and folded into a 32-byte
//! pool with HMAC-SHA-256 together with a fresh extended timestamp. Output is
//! produced by a keystream cipher keyed from the pool. After every request
//! the generator gate derives a new key and counter from the old ones, so a
//! leaked key does not reveal earlier output.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore, TryRngCore};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{KEY_LENGTH, ensure_self_tests, hmac_sha256};
use crate::error::{DbError, Result};
use crate::memory::SecureBuffer;

use super::generator::{COUNTER_SIZE, PoolCipher, increment_counter};

/// Size of the pool in bytes
pub const POOL_SIZE: usize = 32;

/// Size of the accumulation buffer in bytes
pub const ACCUM_SIZE: usize = 64;

/// Size of the buffer serving small requests
pub const GET_BUFFER_SIZE: usize = 64;

/// Upper bound of the entropy estimate (digest size in bits)
pub const MAX_ENTROPY_BITS: u32 = 256;

/// Entropy estimate above which the pool counts as seeded
pub const MIN_SEED_BITS: u32 = 128;

/// Size of a seed file
pub const SEED_FILE_SIZE: usize = 32;

/// Entropy credited for a seed file at most
const SEED_FILE_MAX_CREDIT: u32 = 128;

/// Largest seed file accepted
const SEED_FILE_MAX_LEN: u64 = 64 * 1024;

const EXT_TIMESTAMP_SIZE: usize = 36;

static UPDATE_SEQ: AtomicU64 = AtomicU64::new(0);

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn system_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

fn monotonic_nanos() -> u64 {
    process_start().elapsed().as_nanos() as u64
}

/// Wall clock, monotonic clock, process id and a global sequence number
///
/// The sequence number makes every timestamp unique even when both clocks
/// read the same value.
fn extended_timestamp() -> [u8; EXT_TIMESTAMP_SIZE] {
    let mut ts = [0u8; EXT_TIMESTAMP_SIZE];
    ts[..16].copy_from_slice(&system_nanos().to_le_bytes());
    ts[16..24].copy_from_slice(&monotonic_nanos().to_le_bytes());
    ts[24..28].copy_from_slice(&std::process::id().to_le_bytes());
    let seq = UPDATE_SEQ.fetch_add(1, Ordering::Relaxed);
    ts[28..].copy_from_slice(&seq.to_le_bytes());
    ts
}

fn timestamp_block() -> [u8; COUNTER_SIZE] {
    let mut block = [0u8; COUNTER_SIZE];
    block[..8].copy_from_slice(&(system_nanos() as u64).to_le_bytes());
    let seq = UPDATE_SEQ.fetch_add(1, Ordering::Relaxed);
    block[8..].copy_from_slice(&(monotonic_nanos() ^ seq.rotate_left(32)).to_le_bytes());
    block
}

/// Entropy pool CSPRNG
///
/// All state lives in [`SecureBuffer`]s. Not internally synchronized; share
/// it across threads through a [`PoolHandle`](super::PoolHandle).
pub struct RandomPool {
    cipher: PoolCipher,
    pool: SecureBuffer<POOL_SIZE>,
    accum: SecureBuffer<ACCUM_SIZE>,
    accum_len: usize,
    key: SecureBuffer<KEY_LENGTH>,
    counter: SecureBuffer<COUNTER_SIZE>,
    get_buffer: SecureBuffer<GET_BUFFER_SIZE>,
    get_pos: usize,
    ready: bool,
    entropy_bits: u32,
}

impl RandomPool {
    /// Create a pool seeded from the operating system
    ///
    /// Runs the cryptographic self-tests first; a failure is fatal. An
    /// unavailable OS generator is logged and the pool starts from timestamps
    /// only.
    pub fn new(cipher: PoolCipher) -> Result<Self> {
        ensure_self_tests()?;

        let mut pool = Self {
            cipher,
            pool: SecureBuffer::new(),
            accum: SecureBuffer::new(),
            accum_len: 0,
            key: SecureBuffer::new(),
            counter: SecureBuffer::new(),
            get_buffer: SecureBuffer::new(),
            get_pos: GET_BUFFER_SIZE,
            ready: false,
            entropy_bits: 0,
        };

        let mut seed = Zeroizing::new([0u8; POOL_SIZE]);
        match OsRng.try_fill_bytes(&mut *seed) {
            Ok(()) => pool.add_data_with_entropy(&*seed, MAX_ENTROPY_BITS),
            Err(e) => warn!(error = %e, "OS random generator unavailable"),
        }
        pool.flush();

        debug!(cipher = cipher.name(), "random pool created");
        Ok(pool)
    }

    pub fn cipher(&self) -> PoolCipher {
        self.cipher
    }

    /// Mix `data` into the pool without crediting entropy
    pub fn add_data(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(ACCUM_SIZE - self.accum_len);
            self.accum.as_mut_bytes()[self.accum_len..self.accum_len + n]
                .copy_from_slice(&rest[..n]);
            self.accum_len += n;
            rest = &rest[n..];

            if self.accum_len == ACCUM_SIZE {
                self.update_pool();
            }
        }
    }

    /// Mix `data` into the pool and credit `bits` of entropy
    pub fn add_data_with_entropy(&mut self, data: &[u8], bits: u32) {
        self.add_data(data);
        self.entropy_bits = self.entropy_bits.saturating_add(bits).min(MAX_ENTROPY_BITS);
    }

    /// Current entropy estimate in bits
    pub fn entropy_bits(&self) -> u32 {
        self.entropy_bits
    }

    /// Account for `bits` of entropy handed out as key material
    pub fn consume_entropy(&mut self, bits: u32) {
        self.entropy_bits = self.entropy_bits.saturating_sub(bits);
    }

    pub fn is_seeded(&self) -> bool {
        self.entropy_bits >= MIN_SEED_BITS
    }

    /// Fold the accumulation buffer into the pool and discard the generator
    ///
    /// The next request re-keys from the updated pool.
    pub fn flush(&mut self) {
        self.update_pool();
        self.discard_generator();
    }

    fn update_pool(&mut self) {
        let ts = extended_timestamp();
        let digest = Zeroizing::new(hmac_sha256(
            self.pool.as_bytes(),
            &[&self.accum.as_bytes()[..self.accum_len], &ts[..]],
        ));
        self.pool.as_mut_bytes().copy_from_slice(&*digest);
        self.accum.clear();
        self.accum_len = 0;
    }

    fn discard_generator(&mut self) {
        self.key.clear();
        self.counter.clear();
        self.get_buffer.clear();
        self.get_pos = GET_BUFFER_SIZE;
        self.ready = false;
    }

    /// Key the generator from the pool
    ///
    /// Called implicitly by the first request after a flush.
    pub fn rand_ready(&mut self) {
        let ts = extended_timestamp();
        let key = Zeroizing::new(hmac_sha256(&ts, &[&self.pool.as_bytes()[..]]));
        self.key.as_mut_bytes().copy_from_slice(&*key);

        let counter = self.cipher.encrypt_block(self.key.as_bytes(), &timestamp_block());
        self.counter.as_mut_bytes().copy_from_slice(&counter);

        self.get_buffer.clear();
        self.get_pos = GET_BUFFER_SIZE;
        self.ready = true;
        debug!(cipher = self.cipher.name(), "random generator keyed");
    }

    /// Fill `out` with random bytes
    pub fn get_data(&mut self, out: &mut [u8]) {
        if !self.ready {
            self.rand_ready();
        }

        if out.len() < GET_BUFFER_SIZE {
            let mut filled = 0;
            while filled < out.len() {
                if self.get_pos == GET_BUFFER_SIZE {
                    self.refill_get_buffer();
                }
                let n = (out.len() - filled).min(GET_BUFFER_SIZE - self.get_pos);
                let served = &mut self.get_buffer.as_mut_bytes()[self.get_pos..self.get_pos + n];
                out[filled..filled + n].copy_from_slice(served);
                served.zeroize();
                self.get_pos += n;
                filled += n;
            }
        } else {
            Self::generate(self.cipher, &self.key, &mut self.counter, out);
        }

        self.generator_gate();
    }

    fn refill_get_buffer(&mut self) {
        Self::generate(
            self.cipher,
            &self.key,
            &mut self.counter,
            self.get_buffer.as_mut_bytes(),
        );
        self.generator_gate();
        self.get_pos = 0;
    }

    fn generate(
        cipher: PoolCipher,
        key: &SecureBuffer<KEY_LENGTH>,
        counter: &mut SecureBuffer<COUNTER_SIZE>,
        out: &mut [u8],
    ) {
        cipher.keystream(key.as_bytes(), counter.as_bytes(), out);
        increment_counter(counter.as_mut_bytes(), cipher.counter_steps(out.len()));
    }

    /// Replace key and counter with values derived from themselves
    fn generator_gate(&mut self) {
        let cipher = self.cipher;

        let mut new_key = SecureBuffer::<KEY_LENGTH>::new();
        let k_a = Zeroizing::new(cipher.encrypt_block(self.key.as_bytes(), self.counter.as_bytes()));
        increment_counter(self.counter.as_mut_bytes(), 1);
        let k_b = Zeroizing::new(cipher.encrypt_block(self.key.as_bytes(), self.counter.as_bytes()));
        new_key.as_mut_bytes()[..COUNTER_SIZE].copy_from_slice(&*k_a);
        new_key.as_mut_bytes()[COUNTER_SIZE..].copy_from_slice(&*k_b);

        let mask = Zeroizing::new(cipher.encrypt_block(new_key.as_bytes(), &timestamp_block()));
        let mut mixed = Zeroizing::new(*self.counter.as_bytes());
        for (c, m) in mixed.iter_mut().zip(mask.iter()) {
            *c ^= m;
        }
        let counter = cipher.encrypt_block(new_key.as_bytes(), &mixed);

        self.key = new_key;
        self.counter.as_mut_bytes().copy_from_slice(&counter);
    }

    /// Switch the keystream primitive, keeping the pool
    pub fn change_cipher(&mut self, cipher: PoolCipher) {
        if cipher == self.cipher {
            return;
        }
        self.cipher = cipher;
        self.discard_generator();
        debug!(cipher = cipher.name(), "random pool cipher changed");
    }

    /// Read every buffer so the pages stay resident
    pub fn touch_pool(&self) {
        self.pool.touch();
        self.accum.touch();
        self.key.touch();
        self.counter.touch();
        self.get_buffer.touch();
    }

    /// Move all state into fresh allocations, wiping the old ones
    pub fn move_pool(&mut self) {
        self.pool = self.pool.relocate();
        self.accum = self.accum.relocate();
        self.key = self.key.relocate();
        self.counter = self.counter.relocate();
        self.get_buffer = self.get_buffer.relocate();
        debug!("random pool relocated");
    }

    /// Mix a seed file into the pool and replace it with a fresh seed
    ///
    /// Returns `false` if the file does not exist. The contents add to the
    /// pool; they never replace it.
    pub fn read_seed_file(&mut self, path: &Path) -> Result<bool> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no seed file");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if len > SEED_FILE_MAX_LEN {
            return Err(DbError::FileTooLarge(len));
        }

        let data = Zeroizing::new(fs::read(path)?);
        let credit = u32::try_from(data.len().saturating_mul(8))
            .unwrap_or(u32::MAX)
            .min(SEED_FILE_MAX_CREDIT);
        self.add_data_with_entropy(&data, credit);
        self.flush();
        self.write_seed_file(path)?;

        debug!(path = %path.display(), bits = credit, "seed file consumed");
        Ok(true)
    }

    /// Write fresh pool output to `path`
    pub fn write_seed_file(&mut self, path: &Path) -> Result<()> {
        let mut seed = Zeroizing::new([0u8; SEED_FILE_SIZE]);
        self.get_data(&mut *seed);
        fs::write(path, &*seed)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn current_key(&self) -> [u8; KEY_LENGTH] {
        *self.key.as_bytes()
    }

    #[cfg(test)]
    pub(crate) fn pool_bytes(&self) -> [u8; POOL_SIZE] {
        *self.pool.as_bytes()
    }
}

impl std::fmt::Debug for RandomPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomPool")
            .field("cipher", &self.cipher)
            .field("entropy_bits", &self.entropy_bits)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl RngCore for RandomPool {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.get_data(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.get_data(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.get_data(dst);
    }
}

impl CryptoRng for RandomPool {}
