//! Randomness for the whole crate
//!
//! [`RandomPool`] is the only source of key material, salts, IVs and padding.
//! It is owned explicitly; components that need randomness receive a
//! [`PoolHandle`].

mod entropy;
mod generator;
mod pool;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;

pub use entropy::{EntropyManager, EntropySource};
pub use generator::PoolCipher;
pub use pool::{
    ACCUM_SIZE, GET_BUFFER_SIZE, MAX_ENTROPY_BITS, MIN_SEED_BITS, POOL_SIZE, RandomPool,
    SEED_FILE_SIZE,
};

/// Shared, serialized access to a [`RandomPool`]
#[derive(Clone)]
pub struct PoolHandle(Arc<Mutex<RandomPool>>);

impl PoolHandle {
    /// Create a new pool behind a handle
    pub fn new(cipher: PoolCipher) -> Result<Self> {
        Ok(Self::from_pool(RandomPool::new(cipher)?))
    }

    pub fn from_pool(pool: RandomPool) -> Self {
        Self(Arc::new(Mutex::new(pool)))
    }

    /// Lock the pool for a sequence of calls
    pub fn lock(&self) -> MutexGuard<'_, RandomPool> {
        self.0.lock()
    }

    pub fn add_data(&self, data: &[u8]) {
        self.0.lock().add_data(data);
    }

    pub fn get_data(&self, out: &mut [u8]) {
        self.0.lock().get_data(out);
    }

    pub fn flush(&self) {
        self.0.lock().flush();
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PoolHandle").finish_non_exhaustive()
    }
}
