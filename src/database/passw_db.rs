//! Main database API
//!
//! [`PasswDatabase`] owns the master key, the per-entry password cache and
//! the entry list, and drives the container format on open and save.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use chrono::{Days, NaiveDate};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::DbConfig;
use crate::crypto::{CipherId, CompositeKey, HashId, KEY_LENGTH, derive_key};
use crate::error::{DbError, Result};
use crate::memory::{PasswordCache, SecureBuffer};
use crate::random::PoolHandle;
use crate::utils::{ct_eq, now};
use crate::{FORMAT_VERSION, MAX_FILE_SIZE, SALT_SIZE};

use super::body::next_free_id;
use super::container::{self, SealParams};
use super::models::{DbDefaults, ExpiryDate, PasswDbEntry, PasswHistory};
use super::recovery::{KeyBlock, RecoveryBlocks};

/// Lifecycle state of a [`PasswDatabase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Closed,
    /// An open attempt failed; behaves exactly like `Closed`
    Incomplete,
    Open,
}

/// An encrypted password database
pub struct PasswDatabase {
    pool: PoolHandle,
    config: DbConfig,
    state: DbState,
    /// Format version of the file as last read or written
    version: u16,
    cipher: CipherId,
    hash: HashId,
    kdf_iterations: u32,
    /// Iteration count applied by the next master key change
    pending_kdf_iterations: Option<u32>,
    compression_level: Option<u8>,
    master_key: Option<SecureBuffer<KEY_LENGTH>>,
    salt: [u8; SALT_SIZE],
    recovery: Option<RecoveryBlocks>,
    cache: Option<PasswordCache>,
    entries: Vec<PasswDbEntry>,
    next_id: u32,
    defaults: DbDefaults,
    file_name: Option<PathBuf>,
    /// Read-only handle on the last file read or written
    file: Option<File>,
    modified: bool,
}

impl PasswDatabase {
    /// Closed database using the default configuration
    pub fn new(pool: PoolHandle) -> Self {
        Self::with_config(pool, DbConfig::default())
    }

    /// Closed database; `config` supplies the parameters for new databases
    pub fn with_config(pool: PoolHandle, config: DbConfig) -> Self {
        Self {
            pool,
            state: DbState::Closed,
            version: FORMAT_VERSION,
            cipher: config.cipher,
            hash: config.hash,
            kdf_iterations: config.kdf_iterations,
            pending_kdf_iterations: None,
            compression_level: config.compression_level,
            master_key: None,
            salt: [0u8; SALT_SIZE],
            recovery: None,
            cache: None,
            entries: Vec::new(),
            next_id: 0,
            defaults: DbDefaults::default(),
            file_name: None,
            file: None,
            modified: false,
            config,
        }
    }

    /// Create an empty database protected by `key`
    pub fn create(&mut self, key: &CompositeKey) -> Result<()> {
        self.ensure_not_open()?;
        self.config.validate()?;
        self.reset();

        let mut salt = [0u8; SALT_SIZE];
        self.pool.get_data(&mut salt);
        let master_key = derive_key(key.as_bytes(), &salt, self.kdf_iterations, None)?;

        let cache = PasswordCache::new(&mut self.pool.lock());
        self.pool.flush();

        self.salt = salt;
        self.master_key = Some(SecureBuffer::from_slice(&*master_key));
        self.cache = Some(cache);
        self.state = DbState::Open;
        self.modified = true;

        info!(
            cipher = self.cipher.name(),
            kdf_iterations = self.kdf_iterations,
            "database created"
        );
        Ok(())
    }

    /// Open the database file at `path`
    ///
    /// On any failure nothing of the file is kept and the database is left
    /// in [`DbState::Incomplete`].
    pub fn open(&mut self, path: &Path, key: &CompositeKey) -> Result<()> {
        self.ensure_not_open()?;
        self.reset();
        self.state = DbState::Incomplete;

        match self.load(path, key) {
            Ok(()) => {
                self.state = DbState::Open;
                info!(
                    path = %path.display(),
                    version = format_args!("{:#x}", self.version),
                    entries = self.entries.len(),
                    "database opened"
                );
                Ok(())
            }
            Err(e) => {
                self.reset();
                self.state = DbState::Incomplete;
                warn!(path = %path.display(), error = %e, "failed to open database");
                Err(e)
            }
        }
    }

    fn load(&mut self, path: &Path, key: &CompositeKey) -> Result<()> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size > MAX_FILE_SIZE {
            return Err(DbError::FileTooLarge(size));
        }

        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;

        let mut cache = PasswordCache::new(&mut self.pool.lock());
        let unsealed = container::unseal(&data, key, &mut cache)?;
        self.pool.flush();

        let header = unsealed.header;
        self.version = header.version;
        self.cipher = header.cipher;
        self.hash = header.hash;
        self.kdf_iterations = header.kdf_iterations;
        self.master_key = Some(unsealed.master_key);
        self.salt = unsealed.salt;
        self.recovery = unsealed.recovery;
        self.defaults = unsealed.payload.defaults;
        self.entries = unsealed.payload.entries;
        self.next_id = self
            .entries
            .iter()
            .map(|e| e.id)
            .max()
            .and_then(|id| id.checked_add(1))
            .unwrap_or(0);
        self.cache = Some(cache);
        self.file = Some(file);
        self.file_name = Some(path.to_path_buf());
        self.modified = false;
        Ok(())
    }

    /// Close the database and wipe all key material
    pub fn close(&mut self) {
        if self.state == DbState::Open {
            info!(entries = self.entries.len(), "database closed");
        }
        self.reset();
    }

    fn reset(&mut self) {
        // dropping the buffers zeroizes them
        self.master_key = None;
        self.cache = None;
        self.recovery = None;
        self.salt = [0u8; SALT_SIZE];
        self.entries.clear();
        self.next_id = 0;
        self.defaults = DbDefaults::default();
        self.file = None;
        self.file_name = None;
        self.modified = false;
        self.pending_kdf_iterations = None;
        self.version = FORMAT_VERSION;
        self.cipher = self.config.cipher;
        self.hash = self.config.hash;
        self.kdf_iterations = self.config.kdf_iterations;
        self.compression_level = self.config.compression_level;
        self.state = DbState::Closed;
    }

    /// Save to the file the database was opened from or last saved to
    pub fn save(&mut self) -> Result<()> {
        let path = self
            .file_name
            .clone()
            .ok_or_else(|| DbError::InvalidOperation("database has no file name".to_string()))?;
        self.save_to_file(&path)
    }

    /// Save to `path` in the current format version
    ///
    /// The file is written to a temporary file next to `path`, synced and
    /// renamed over the destination. The previous read handle is released
    /// only after the new file has been reopened read-only.
    pub fn save_to_file(&mut self, path: &Path) -> Result<()> {
        self.save_to_file_version(path, FORMAT_VERSION)
    }

    pub(crate) fn save_to_file_version(&mut self, path: &Path, version: u16) -> Result<()> {
        self.ensure_open()?;

        // key blocks carry the key check, the outer salt is refreshed
        if self.recovery.is_some() {
            self.pool.get_data(&mut self.salt);
        }

        let bytes = {
            let master_key = self.master_key.as_ref().ok_or(DbError::NotOpen)?;
            let cache = self.cache.as_ref().ok_or(DbError::NotOpen)?;
            let params = SealParams {
                version,
                cipher: self.cipher,
                hash: self.hash,
                kdf_iterations: self.kdf_iterations,
                compression_level: self.compression_level,
                master_key: master_key.as_bytes(),
                salt: &self.salt,
                recovery: self.recovery.as_ref(),
                defaults: &self.defaults,
                entries: &self.entries,
                cache,
            };
            container::seal(&params, &mut self.pool.lock())?
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DbError::Io(e.error))?;

        let file = File::open(path)?;
        self.file = Some(file);
        self.file_name = Some(path.to_path_buf());
        self.version = version;
        self.modified = false;
        self.pool.flush();

        info!(
            path = %path.display(),
            entries = self.entries.len(),
            size = bytes.len(),
            "database saved"
        );
        Ok(())
    }

    // ---- State ----

    pub fn state(&self) -> DbState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == DbState::Open
    }

    /// Unsaved changes exist
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    /// Format version of the file as last read or written
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn cipher(&self) -> CipherId {
        self.cipher
    }

    pub fn hash(&self) -> HashId {
        self.hash
    }

    pub fn compression_level(&self) -> Option<u8> {
        self.compression_level
    }

    /// Random pool shared with this database
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != DbState::Open {
            return Err(DbError::NotOpen);
        }
        Ok(())
    }

    fn ensure_not_open(&self) -> Result<()> {
        if self.state == DbState::Open {
            return Err(DbError::InvalidOperation("database is already open".to_string()));
        }
        Ok(())
    }

    fn master_key(&self) -> Result<&SecureBuffer<KEY_LENGTH>> {
        self.master_key.as_ref().ok_or(DbError::NotOpen)
    }

    // ---- Algorithms ----

    /// Select the bulk cipher for the next save
    ///
    /// Not allowed while a recovery key is set since the key blocks are
    /// wrapped with the current cipher.
    pub fn set_cipher(&mut self, cipher: CipherId) -> Result<()> {
        self.ensure_open()?;
        if cipher == self.cipher {
            return Ok(());
        }
        if self.recovery.is_some() {
            return Err(DbError::InvalidOperation(
                "remove the recovery key before changing the cipher".to_string(),
            ));
        }
        self.cipher = cipher;
        self.modified = true;
        Ok(())
    }

    pub fn set_hash(&mut self, hash: HashId) -> Result<()> {
        self.ensure_open()?;
        if hash != self.hash {
            self.hash = hash;
            self.modified = true;
        }
        Ok(())
    }

    /// DEFLATE level for the next save, `None` to store uncompressed
    pub fn set_compression_level(&mut self, level: Option<u8>) -> Result<()> {
        self.ensure_open()?;
        if let Some(level) = level {
            if level > 9 {
                return Err(DbError::InvalidOperation(format!(
                    "compression level must be 0-9, got {}",
                    level
                )));
            }
        }
        if level != self.compression_level {
            self.compression_level = level;
            self.modified = true;
        }
        Ok(())
    }

    /// Iteration count of the current master key material
    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    /// Set the iteration count used by the next [`change_master_key`](Self::change_master_key)
    pub fn set_kdf_iterations(&mut self, iterations: u32) -> Result<()> {
        self.ensure_open()?;
        if iterations == 0 {
            return Err(DbError::InvalidOperation(
                "KDF iteration count must be at least 1".to_string(),
            ));
        }
        self.pending_kdf_iterations = Some(iterations);
        Ok(())
    }

    // ---- Keys ----

    /// Check whether `key` is the current master key
    pub fn check_master_key(&self, key: &CompositeKey) -> Result<bool> {
        self.ensure_open()?;
        let master_key = self.master_key()?;
        let candidate = match &self.recovery {
            Some(blocks) => blocks.primary.unwrap(key, self.cipher)?,
            None => derive_key(key.as_bytes(), &self.salt, self.kdf_iterations, None)?,
        };
        Ok(ct_eq(&*candidate, master_key.as_bytes()))
    }

    /// Replace the key protecting the database
    ///
    /// Applies a pending iteration count. With a recovery key only the
    /// primary key block is rewrapped; otherwise a new salt and master key
    /// are derived. If `cancel` is raised during derivation the previous key
    /// stays in force and `Cancelled` is returned.
    pub fn change_master_key(&mut self, key: &CompositeKey, cancel: Option<&AtomicBool>) -> Result<()> {
        self.ensure_open()?;
        let iterations = self.pending_kdf_iterations.unwrap_or(self.kdf_iterations);

        if self.recovery.is_some() {
            let primary = KeyBlock::wrap(
                self.master_key()?.as_bytes(),
                key,
                self.cipher,
                iterations,
                &self.pool,
                cancel,
            )?;
            if let Some(blocks) = self.recovery.as_mut() {
                blocks.primary = primary;
            }
        } else {
            let mut salt = [0u8; SALT_SIZE];
            self.pool.get_data(&mut salt);
            let master_key = derive_key(key.as_bytes(), &salt, iterations, cancel)?;
            self.salt = salt;
            self.master_key = Some(SecureBuffer::from_slice(&*master_key));
        }

        self.kdf_iterations = iterations;
        self.pending_kdf_iterations = None;
        self.modified = true;
        self.pool.flush();
        info!(kdf_iterations = iterations, "master key changed");
        Ok(())
    }

    /// Let `recovery` unlock the database alongside `primary`
    ///
    /// `primary` must be the current master key. Replaces an existing
    /// recovery key.
    pub fn set_recovery_key(
        &mut self,
        primary: &CompositeKey,
        recovery: &CompositeKey,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        if !self.check_master_key(primary)? {
            return Err(DbError::InvalidKey);
        }

        let master_key = self.master_key()?.as_bytes();
        let blocks = RecoveryBlocks {
            primary: KeyBlock::wrap(master_key, primary, self.cipher, self.kdf_iterations, &self.pool, cancel)?,
            recovery: KeyBlock::wrap(master_key, recovery, self.cipher, self.kdf_iterations, &self.pool, cancel)?,
        };
        self.recovery = Some(blocks);
        self.modified = true;
        self.pool.flush();
        info!("recovery key set");
        Ok(())
    }

    /// Drop the recovery key; the master key is derived from `primary` again
    pub fn remove_recovery_key(&mut self, primary: &CompositeKey, cancel: Option<&AtomicBool>) -> Result<()> {
        self.ensure_open()?;
        if self.recovery.is_none() {
            return Err(DbError::InvalidOperation("no recovery key set".to_string()));
        }
        if !self.check_master_key(primary)? {
            return Err(DbError::InvalidKey);
        }

        let mut salt = [0u8; SALT_SIZE];
        self.pool.get_data(&mut salt);
        let master_key = derive_key(primary.as_bytes(), &salt, self.kdf_iterations, cancel)?;

        self.salt = salt;
        self.master_key = Some(SecureBuffer::from_slice(&*master_key));
        self.recovery = None;
        self.modified = true;
        self.pool.flush();
        info!("recovery key removed");
        Ok(())
    }

    /// Check `key` against the recovery key, `false` when none is set
    pub fn check_recovery_key(&self, key: &CompositeKey) -> Result<bool> {
        self.ensure_open()?;
        let Some(blocks) = &self.recovery else {
            return Ok(false);
        };
        let candidate = blocks.recovery.unwrap(key, self.cipher)?;
        Ok(ct_eq(&*candidate, self.master_key()?.as_bytes()))
    }

    pub fn has_recovery_key(&self) -> bool {
        self.recovery.is_some()
    }

    // ---- Entries ----

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PasswDbEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Result<&PasswDbEntry> {
        self.ensure_open()?;
        self.entries.get(index).ok_or(DbError::EntryNotFound(index))
    }

    /// Mutable access to an entry; marks the database modified
    pub fn entry_mut(&mut self, index: usize) -> Result<&mut PasswDbEntry> {
        self.ensure_open()?;
        let entry = self.entries.get_mut(index).ok_or(DbError::EntryNotFound(index))?;
        self.modified = true;
        Ok(entry)
    }

    pub fn find_entry_by_id(&self, id: u32) -> Option<&PasswDbEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// New entry prefilled from the database defaults, not yet added
    pub fn new_entry(&self) -> PasswDbEntry {
        let mut entry = PasswDbEntry::new("", &self.defaults.user_name);
        if self.defaults.expiry_days > 0 {
            entry.expiry_date = entry
                .creation_time
                .date_naive()
                .checked_add_days(Days::new(u64::from(self.defaults.expiry_days)))
                .and_then(ExpiryDate::from_naive_date);
        }
        if self.defaults.passw_history_size > 0 {
            entry.passw_history = PasswHistory::new(true, self.defaults.passw_history_size);
        }
        entry
    }

    /// Append `entry` and return its index
    ///
    /// The entry gets a fresh id and starts without a password; use
    /// [`set_db_entry_passw`](Self::set_db_entry_passw) afterwards.
    pub fn add_entry(&mut self, mut entry: PasswDbEntry) -> Result<usize> {
        self.ensure_open()?;
        let used: HashSet<u32> = self.entries.iter().map(|e| e.id).collect();
        let id = next_free_id(&used, self.next_id)
            .ok_or_else(|| DbError::InvalidOperation("entry ids exhausted".to_string()))?;
        self.next_id = id.checked_add(1).unwrap_or(0);

        let index = self.entries.len();
        entry.id = id;
        entry.index = index;
        entry.passw = None;
        self.entries.push(entry);
        self.modified = true;
        debug!(id, index, "entry added");
        Ok(index)
    }

    pub fn delete_entry(&mut self, index: usize) -> Result<()> {
        self.ensure_open()?;
        if index >= self.entries.len() {
            return Err(DbError::EntryNotFound(index));
        }
        let entry = self.entries.remove(index);
        self.reindex();
        self.modified = true;
        debug!(id = entry.id, index, "entry deleted");
        Ok(())
    }

    /// Move the entry at `from` so it ends up at position `to`
    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<()> {
        self.ensure_open()?;
        let len = self.entries.len();
        if from >= len {
            return Err(DbError::EntryNotFound(from));
        }
        if to >= len {
            return Err(DbError::EntryNotFound(to));
        }
        if from != to {
            let entry = self.entries.remove(from);
            self.entries.insert(to, entry);
            self.reindex();
            self.modified = true;
        }
        Ok(())
    }

    fn reindex(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.index = i;
        }
    }

    /// Set the password of the entry at `index`
    ///
    /// The previous password goes to the entry's history when enabled.
    pub fn set_db_entry_passw(&mut self, index: usize, passw: &str) -> Result<()> {
        self.ensure_open()?;
        let cache = self.cache.as_mut().ok_or(DbError::NotOpen)?;
        let entry = self.entries.get_mut(index).ok_or(DbError::EntryNotFound(index))?;

        let previous = match &entry.passw {
            Some(sealed) => Some(cache.open(entry.id, sealed)?),
            None => None,
        };
        if let Some(previous) = &previous {
            if previous.as_str() == passw {
                return Ok(());
            }
            if !previous.is_empty() {
                entry.passw_history.push(entry.passw_change_time, previous);
            }
        }

        entry.passw = Some(cache.seal(entry.id, passw)?);
        let now = now();
        entry.passw_change_time = now;
        entry.modification_time = now;
        self.modified = true;
        Ok(())
    }

    /// Decrypt the password of the entry at `index`
    ///
    /// Fails with [`DbError::CacheCorrupted`] if the cached value no longer
    /// authenticates.
    pub fn get_db_entry_passw(&self, index: usize) -> Result<Zeroizing<String>> {
        self.ensure_open()?;
        let cache = self.cache.as_ref().ok_or(DbError::NotOpen)?;
        let entry = self.entries.get(index).ok_or(DbError::EntryNotFound(index))?;
        match &entry.passw {
            Some(sealed) => cache.open(entry.id, sealed),
            None => Ok(Zeroizing::new(String::new())),
        }
    }

    // ---- Defaults and queries ----

    pub fn defaults(&self) -> &DbDefaults {
        &self.defaults
    }

    pub fn set_defaults(&mut self, defaults: DbDefaults) -> Result<()> {
        self.ensure_open()?;
        if defaults != self.defaults {
            self.defaults = defaults;
            self.modified = true;
        }
        Ok(())
    }

    /// Entries whose expiry date is on or before `today`
    pub fn expired_entries(&self, today: NaiveDate) -> Vec<&PasswDbEntry> {
        self.entries.iter().filter(|e| e.is_expired(today)).collect()
    }
}

impl std::fmt::Debug for PasswDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswDatabase")
            .field("state", &self.state)
            .field("version", &format_args!("{:#x}", self.version))
            .field("cipher", &self.cipher)
            .field("hash", &self.hash)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("entries", &self.entries.len())
            .field("file_name", &self.file_name)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

impl Drop for PasswDatabase {
    fn drop(&mut self) {
        self.close();
    }
}
