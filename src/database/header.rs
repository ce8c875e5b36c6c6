//! Outer (plaintext) and inner (encrypted) headers

use crate::crypto::{CipherId, HashId, KdfId};
use crate::error::{DbError, Result};
use crate::{FORMAT_VERSION, MAGIC};

use super::codec::{ByteReader, ByteWriter};

/// Oldest readable version
pub const VERSION_INITIAL: u16 = 0x100;
/// HMAC tag appended after the ciphertext
pub const VERSION_HMAC: u16 = 0x101;
/// Tagged global settings in the payload
pub const VERSION_GLOBAL_SETTINGS: u16 = 0x102;
/// Optional recovery key blocks
pub const VERSION_RECOVERY_KEY: u16 = 0x103;
/// Compressed payload, extended inner header, HMAC over salt and IV
pub const VERSION_COMPRESSION: u16 = 0x104;

/// Recovery key blocks follow the file header
pub const FLAG_RECOVERY_KEY: u32 = 0x0000_0001;

pub const FILE_HEADER_SIZE: usize = 18;
pub const INNER_HEADER_SIZE: usize = 26;
pub const INNER_HEADER_SIZE_LEGACY: usize = 16;

/// Compression of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate { level: u8 },
}

impl Compression {
    fn algo(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate { .. } => 1,
        }
    }

    fn level(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate { level } => level,
        }
    }
}

/// Plaintext header naming the algorithms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub flags: u32,
    pub cipher: CipherId,
    pub hash: HashId,
    pub kdf: KdfId,
    pub kdf_iterations: u32,
}

impl FileHeader {
    pub fn has_recovery_key(&self) -> bool {
        self.flags & FLAG_RECOVERY_KEY != 0
    }

    /// Size of the trailing tag, 0 before HMAC was introduced
    pub fn tag_size(&self) -> usize {
        if self.version >= VERSION_HMAC {
            self.hash.tag_size()
        } else {
            0
        }
    }

    /// Parse and validate; every id is checked before any key work starts
    pub(crate) fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let magic: [u8; 4] = r.read_array()?;
        if &magic != MAGIC {
            return Err(DbError::format("not a password database"));
        }

        let header_size = r.read_u8()? as usize;
        if header_size < FILE_HEADER_SIZE {
            return Err(DbError::format(format!("header size {} too small", header_size)));
        }

        let version = r.read_u16()?;
        if !(VERSION_INITIAL..=FORMAT_VERSION).contains(&version) {
            return Err(DbError::format(format!("unsupported version {:#x}", version)));
        }

        let flags = r.read_u32()?;
        let cipher_id = r.read_u8()?;
        let cipher = CipherId::from_u8(cipher_id)
            .ok_or_else(|| DbError::format(format!("unknown cipher id {}", cipher_id)))?;
        let hash_id = r.read_u8()?;
        let hash = HashId::from_u8(hash_id)
            .ok_or_else(|| DbError::format(format!("unknown hash id {}", hash_id)))?;
        let kdf_id = r.read_u8()?;
        let kdf = KdfId::from_u8(kdf_id)
            .ok_or_else(|| DbError::format(format!("unknown KDF id {}", kdf_id)))?;

        let kdf_iterations = r.read_u32()?;
        if kdf_iterations == 0 {
            return Err(DbError::format("KDF iteration count is zero"));
        }
        if flags & FLAG_RECOVERY_KEY != 0 && version < VERSION_RECOVERY_KEY {
            return Err(DbError::format("recovery key flag in pre-recovery version"));
        }

        // newer writers may append fields we do not know
        r.skip(header_size - FILE_HEADER_SIZE)?;

        Ok(Self {
            version,
            flags,
            cipher,
            hash,
            kdf,
            kdf_iterations,
        })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter) {
        w.put_bytes(MAGIC);
        w.put_u8(FILE_HEADER_SIZE as u8);
        w.put_u16(self.version);
        w.put_u32(self.flags);
        w.put_u8(self.cipher.as_u8());
        w.put_u8(self.hash.as_u8());
        w.put_u8(self.kdf.as_u8());
        w.put_u32(self.kdf_iterations);
    }
}

/// Header at the start of the decrypted body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerHeader {
    pub flags: u32,
    pub num_variable_params: u8,
    pub num_fields: u8,
    pub num_entries: u32,
    pub compression: Compression,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

impl InnerHeader {
    pub fn size_for(version: u16) -> usize {
        if version >= VERSION_COMPRESSION {
            INNER_HEADER_SIZE
        } else {
            INNER_HEADER_SIZE_LEGACY
        }
    }

    /// Parse the inner header
    ///
    /// A magic mismatch here means the wrong key was used and is reported as
    /// `InvalidKey`.
    pub(crate) fn read(r: &mut ByteReader<'_>, version: u16) -> Result<Self> {
        let magic: [u8; 4] = r.read_array().map_err(|_| DbError::InvalidKey)?;
        if &magic != MAGIC {
            return Err(DbError::InvalidKey);
        }

        let header_size = r.read_u16()? as usize;
        let min_size = Self::size_for(version);
        if header_size < min_size {
            return Err(DbError::format(format!("inner header size {} too small", header_size)));
        }

        let flags = r.read_u32()?;
        let num_variable_params = r.read_u8()?;
        let num_fields = r.read_u8()?;
        let num_entries = r.read_u32()?;

        let (compression, uncompressed_size, compressed_size) = if version >= VERSION_COMPRESSION {
            let algo = r.read_u8()?;
            let level = r.read_u8()?;
            let uncompressed = r.read_u32()?;
            let compressed = r.read_u32()?;
            let compression = match algo {
                0 => Compression::None,
                1 => Compression::Deflate { level },
                other => {
                    return Err(DbError::format(format!("unknown compression algorithm {}", other)));
                }
            };
            (compression, uncompressed, compressed)
        } else {
            (Compression::None, 0, 0)
        };

        r.skip(header_size - min_size)?;

        Ok(Self {
            flags,
            num_variable_params,
            num_fields,
            num_entries,
            compression,
            uncompressed_size,
            compressed_size,
        })
    }

    pub(crate) fn write(&self, w: &mut ByteWriter, version: u16) {
        let size = Self::size_for(version);
        w.put_bytes(MAGIC);
        w.put_u16(size as u16);
        w.put_u32(self.flags);
        w.put_u8(self.num_variable_params);
        w.put_u8(self.num_fields);
        w.put_u32(self.num_entries);
        if version >= VERSION_COMPRESSION {
            w.put_u8(self.compression.algo());
            w.put_u8(self.compression.level());
            w.put_u32(self.uncompressed_size);
            w.put_u32(self.compressed_size);
        }
    }
}
