//! Entropy estimation for user and system events
//!
//! Each event is mixed into the pool together with a monotonic timestamp and
//! credited with a fixed per-source estimate. Repeating the previous event of
//! the same source earns nothing.

use std::time::Instant;

use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{DbError, Result};

use super::PoolHandle;

/// Kind of event feeding the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntropySource {
    Keyboard,
    MouseMove,
    MouseClick,
    TimerJitter,
    System,
}

impl EntropySource {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Self::Keyboard => 0,
            Self::MouseMove => 1,
            Self::MouseClick => 2,
            Self::TimerJitter => 3,
            Self::System => 4,
        }
    }

    /// Bits credited for one distinct event
    ///
    /// System entropy is credited per byte instead, see
    /// [`EntropyManager::add_system_entropy`].
    pub fn bits_per_event(self) -> u32 {
        match self {
            Self::Keyboard => 2,
            Self::MouseMove => 1,
            Self::MouseClick => 2,
            Self::TimerJitter => 1,
            Self::System => 0,
        }
    }
}

/// Turns discrete events into entropy credit on a shared pool
pub struct EntropyManager {
    pool: PoolHandle,
    last_event: [Option<[u8; 32]>; EntropySource::COUNT],
    credited: [u64; EntropySource::COUNT],
    last_jitter: Instant,
}

impl EntropyManager {
    pub fn new(pool: PoolHandle) -> Self {
        Self {
            pool,
            last_event: [None; EntropySource::COUNT],
            credited: [0; EntropySource::COUNT],
            last_jitter: Instant::now(),
        }
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Mix an event and return the bits credited for it
    pub fn add_event(&mut self, source: EntropySource, data: &[u8]) -> u32 {
        let fingerprint: [u8; 32] = Sha256::digest(data).into();
        let slot = &mut self.last_event[source.index()];
        let bits = if slot.as_ref() == Some(&fingerprint) {
            0
        } else {
            source.bits_per_event()
        };
        *slot = Some(fingerprint);

        let stamp = self.last_jitter.elapsed().as_nanos() as u64;
        {
            let mut pool = self.pool.lock();
            pool.add_data(&stamp.to_le_bytes());
            pool.add_data_with_entropy(data, bits);
        }
        self.credited[source.index()] += u64::from(bits);
        bits
    }

    pub fn add_keyboard_event(&mut self, key_code: u32) -> u32 {
        self.add_event(EntropySource::Keyboard, &key_code.to_le_bytes())
    }

    pub fn add_mouse_move(&mut self, x: i32, y: i32) -> u32 {
        self.add_event(EntropySource::MouseMove, &point_bytes(x, y))
    }

    pub fn add_mouse_click(&mut self, x: i32, y: i32) -> u32 {
        self.add_event(EntropySource::MouseClick, &point_bytes(x, y))
    }

    /// Sample the delay since the previous jitter sample
    pub fn add_timer_jitter(&mut self) -> u32 {
        let now = Instant::now();
        let delta = now.duration_since(self.last_jitter).as_nanos() as u64;
        self.last_jitter = now;
        self.add_event(EntropySource::TimerJitter, &delta.to_le_bytes())
    }

    /// Pull `len` bytes from the OS generator, crediting 8 bits per byte
    pub fn add_system_entropy(&mut self, len: usize) -> Result<u32> {
        let mut buf = Zeroizing::new(vec![0u8; len]);
        OsRng.try_fill_bytes(&mut buf).map_err(|e| {
            warn!(error = %e, "OS random generator unavailable");
            DbError::Io(std::io::Error::other(e.to_string()))
        })?;

        let bits = u32::try_from(len.saturating_mul(8)).unwrap_or(u32::MAX);
        self.pool.lock().add_data_with_entropy(&buf, bits);
        self.credited[EntropySource::System.index()] += u64::from(bits);
        debug!(bytes = len, "system entropy added");
        Ok(bits)
    }

    /// Total bits credited from `source` so far
    pub fn credited_bits(&self, source: EntropySource) -> u64 {
        self.credited[source.index()]
    }

    /// Entropy estimate of the underlying pool
    pub fn pool_entropy_bits(&self) -> u32 {
        self.pool.lock().entropy_bits()
    }
}

fn point_bytes(x: i32, y: i32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&x.to_le_bytes());
    buf[4..].copy_from_slice(&y.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::PoolCipher;

    fn manager() -> EntropyManager {
        let handle = PoolHandle::new(PoolCipher::default()).unwrap();
        handle.lock().consume_entropy(u32::MAX);
        EntropyManager::new(handle)
    }

    #[test]
    fn test_per_source_estimates() {
        let mut m = manager();
        assert_eq!(m.add_keyboard_event(65), 2);
        assert_eq!(m.add_mouse_move(10, 20), 1);
        assert_eq!(m.add_mouse_click(10, 20), 2);
        assert_eq!(m.pool_entropy_bits(), 5);
    }

    #[test]
    fn test_repeated_event_earns_nothing() {
        let mut m = manager();
        assert_eq!(m.add_keyboard_event(65), 2);
        assert_eq!(m.add_keyboard_event(65), 0);
        assert_eq!(m.add_keyboard_event(66), 2);
        assert_eq!(m.credited_bits(EntropySource::Keyboard), 4);
    }

    #[test]
    fn test_sources_tracked_separately() {
        let mut m = manager();
        assert_eq!(m.add_mouse_move(1, 1), 1);
        assert_eq!(m.add_mouse_click(1, 1), 2);
        assert_eq!(m.add_mouse_move(1, 1), 0);
    }

    #[test]
    fn test_system_entropy() {
        let mut m = manager();
        assert_eq!(m.add_system_entropy(16).unwrap(), 128);
        assert_eq!(m.credited_bits(EntropySource::System), 128);
        assert_eq!(m.pool_entropy_bits(), 128);
        assert!(m.pool().lock().is_seeded());
    }

    #[test]
    fn test_timer_jitter_credits_at_most_one_bit() {
        let mut m = manager();
        let bits = m.add_timer_jitter();
        assert!(bits <= 1);
    }
}
