//! Key blocks wrapping the master key under a passphrase-derived key
//!
//! With a recovery key enabled the file carries two blocks, one for the
//! primary key and one for the recovery key. Each holds its own salt and
//! iteration count so either secret independently recovers the master key.

use std::sync::atomic::AtomicBool;

use zeroize::Zeroizing;

use crate::SALT_SIZE;
use crate::crypto::{CipherId, CipherSuite, CompositeKey, KEY_LENGTH, derive_key};
use crate::error::{DbError, Result};
use crate::random::PoolHandle;

use super::codec::{ByteReader, ByteWriter};

/// Salt, iterations, IV and the wrapped master key
#[derive(Clone)]
pub(crate) struct KeyBlock {
    salt: [u8; SALT_SIZE],
    iterations: u32,
    iv: Vec<u8>,
    wrapped: [u8; KEY_LENGTH],
}

impl KeyBlock {
    /// Wrap `master_key` under a key derived from `key`
    pub fn wrap(
        master_key: &[u8; KEY_LENGTH],
        key: &CompositeKey,
        cipher: CipherId,
        iterations: u32,
        pool: &PoolHandle,
        cancel: Option<&AtomicBool>,
    ) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        let mut iv = vec![0u8; cipher.iv_size()];
        {
            let mut pool = pool.lock();
            pool.get_data(&mut salt);
            pool.get_data(&mut iv);
        }

        let kek = derive_key(key.as_bytes(), &salt, iterations, cancel)?;
        let mut wrapped = *master_key;
        let mut suite = CipherSuite::new(cipher, &kek);
        suite.set_iv(&iv)?;
        suite.encrypt(&mut wrapped)?;

        Ok(Self {
            salt,
            iterations,
            iv,
            wrapped,
        })
    }

    /// Unwrap with `key`
    ///
    /// The block carries no check value; a wrong key yields a wrong master
    /// key which the caller detects through the file's authentication.
    pub fn unwrap(&self, key: &CompositeKey, cipher: CipherId) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        let kek = derive_key(key.as_bytes(), &self.salt, self.iterations, None)?;
        let mut master_key = Zeroizing::new(self.wrapped);
        let mut suite = CipherSuite::new(cipher, &kek);
        suite.set_iv(&self.iv)?;
        suite.decrypt(&mut *master_key)?;
        Ok(master_key)
    }

    fn read(r: &mut ByteReader<'_>, cipher: CipherId) -> Result<Self> {
        let salt = r.read_array()?;
        let iterations = r.read_u32()?;
        if iterations == 0 {
            return Err(DbError::format("key block iteration count is zero"));
        }
        let iv = r.read_bytes(cipher.iv_size())?.to_vec();
        let wrapped = r.read_array()?;
        Ok(Self {
            salt,
            iterations,
            iv,
            wrapped,
        })
    }

    fn write(&self, w: &mut ByteWriter) {
        w.put_bytes(&self.salt);
        w.put_u32(self.iterations);
        w.put_bytes(&self.iv);
        w.put_bytes(&self.wrapped);
    }
}

/// Primary and recovery key blocks
#[derive(Clone)]
pub(crate) struct RecoveryBlocks {
    pub primary: KeyBlock,
    pub recovery: KeyBlock,
}

impl RecoveryBlocks {
    pub fn read(r: &mut ByteReader<'_>, cipher: CipherId) -> Result<Self> {
        let primary = KeyBlock::read(r, cipher)?;
        let recovery = KeyBlock::read(r, cipher)?;
        Ok(Self { primary, recovery })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        self.primary.write(w);
        self.recovery.write(w);
    }
}
