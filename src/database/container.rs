//! Encrypted container: header, key material, ciphertext and tag
//!
//! File layout:
//!
//! ```text
//! FileHeader
//! [primary KeyBlock ‖ recovery KeyBlock]     flag bit 0, >= 0x103
//! salt[32] ‖ iv[iv_size]
//! ciphertext                                 InnerHeader ‖ payload ‖ padding
//! tag                                        >= 0x101
//! ```
//!
//! The tag covers the ciphertext for 0x101..0x103 and salt ‖ IV ‖ ciphertext
//! from 0x104 on. It is verified before anything inside the ciphertext is
//! parsed.

use std::io::{Read, Write};

use flate2::Compression as DeflateLevel;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{Authenticator, CipherId, CipherSuite, CompositeKey, HashId, KEY_LENGTH, KdfId, derive_key};
use crate::error::{DbError, Result};
use crate::memory::{PasswordCache, SecureBuffer};
use crate::random::RandomPool;
use crate::{MAX_FILE_SIZE, SALT_SIZE};

use super::body::{self, Payload};
use super::codec::{ByteReader, ByteWriter, checked_len};
use super::header::{
    Compression, FLAG_RECOVERY_KEY, FileHeader, INNER_HEADER_SIZE, InnerHeader, VERSION_COMPRESSION, VERSION_HMAC,
    VERSION_INITIAL, VERSION_RECOVERY_KEY,
};
use super::models::{DbDefaults, FieldId, PasswDbEntry};
use super::recovery::RecoveryBlocks;

/// Everything needed to write a database file
pub(crate) struct SealParams<'a> {
    pub version: u16,
    pub cipher: CipherId,
    pub hash: HashId,
    pub kdf_iterations: u32,
    pub compression_level: Option<u8>,
    pub master_key: &'a [u8; KEY_LENGTH],
    pub salt: &'a [u8; SALT_SIZE],
    pub recovery: Option<&'a RecoveryBlocks>,
    pub defaults: &'a DbDefaults,
    pub entries: &'a [PasswDbEntry],
    pub cache: &'a PasswordCache,
}

/// Result of a successful open
pub(crate) struct Unsealed {
    pub header: FileHeader,
    pub master_key: SecureBuffer<KEY_LENGTH>,
    pub salt: [u8; SALT_SIZE],
    pub recovery: Option<RecoveryBlocks>,
    pub payload: Payload,
}

/// Serialize, encrypt and authenticate a database
pub(crate) fn seal(params: &SealParams<'_>, pool: &mut RandomPool) -> Result<Vec<u8>> {
    let version = params.version;
    if !(VERSION_INITIAL..=crate::FORMAT_VERSION).contains(&version) {
        return Err(DbError::InvalidOperation(format!("cannot write version {:#x}", version)));
    }
    if params.recovery.is_some() && version < VERSION_RECOVERY_KEY {
        return Err(DbError::InvalidOperation(format!(
            "version {:#x} cannot store a recovery key",
            version
        )));
    }

    let mut payload = ByteWriter::new();
    body::write_payload(&mut payload, version, params.defaults, params.entries, params.cache)?;
    let payload = payload.into_inner();

    let (stored, compression) = match params.compression_level {
        Some(level) if version >= VERSION_COMPRESSION => {
            let level = level.min(9);
            (deflate(&payload, level)?, Compression::Deflate { level })
        }
        _ => (payload.clone(), Compression::None),
    };

    let inner = InnerHeader {
        flags: 0,
        num_variable_params: body::settings_count(version),
        num_fields: FieldId::ALL.len() as u8,
        num_entries: checked_len(params.entries.len())?,
        compression,
        uncompressed_size: checked_len(payload.len())?,
        compressed_size: checked_len(stored.len())?,
    };

    let mut plain = ByteWriter::with_capacity(params.cipher.align_to_block_size(INNER_HEADER_SIZE + stored.len()));
    inner.write(&mut plain, version);
    plain.put_bytes(&stored);
    drop(stored);
    drop(payload);

    // block ciphers are padded with random bytes, never zeros
    let aligned = params.cipher.align_to_block_size(plain.len());
    let mut padding = Zeroizing::new(vec![0u8; aligned - plain.len()]);
    pool.get_data(&mut padding);
    plain.put_bytes(&padding);

    let mut ciphertext = plain.into_inner();
    let mut iv = vec![0u8; params.cipher.iv_size()];
    pool.get_data(&mut iv);
    let mut suite = CipherSuite::new(params.cipher, params.master_key);
    suite.set_iv(&iv)?;
    suite.encrypt(&mut ciphertext)?;

    let header = FileHeader {
        version,
        flags: if params.recovery.is_some() { FLAG_RECOVERY_KEY } else { 0 },
        cipher: params.cipher,
        hash: params.hash,
        kdf: KdfId::Pbkdf2Sha256,
        kdf_iterations: params.kdf_iterations,
    };

    let mut out = ByteWriter::new();
    header.write(&mut out);
    if let Some(blocks) = params.recovery {
        blocks.write(&mut out);
    }
    out.put_bytes(params.salt);
    out.put_bytes(&iv);
    out.put_bytes(&ciphertext);

    if version >= VERSION_HMAC {
        let mut auth = Authenticator::new(params.hash, params.master_key);
        authenticate(&mut auth, version, params.salt, &iv, &ciphertext);
        out.put_bytes(&auth.finalize());
    }

    let bytes = out.into_inner().to_vec();
    if bytes.len() as u64 > MAX_FILE_SIZE {
        return Err(DbError::FileTooLarge(bytes.len() as u64));
    }
    debug!(
        version = format_args!("{:#x}", version),
        entries = params.entries.len(),
        size = bytes.len(),
        "database sealed"
    );
    Ok(bytes)
}

fn authenticate(auth: &mut Authenticator, version: u16, salt: &[u8], iv: &[u8], ciphertext: &[u8]) {
    if version >= VERSION_COMPRESSION {
        auth.update(salt);
        auth.update(iv);
    }
    auth.update(ciphertext);
}

/// Parse, authenticate and decrypt a database
///
/// Format errors in the plaintext header are reported before any key
/// derivation. Every key candidate that fails authentication, and an inner
/// magic mismatch, end in the same `InvalidKey`.
pub(crate) fn unseal(data: &[u8], key: &CompositeKey, cache: &mut PasswordCache) -> Result<Unsealed> {
    if data.len() as u64 > MAX_FILE_SIZE {
        return Err(DbError::FileTooLarge(data.len() as u64));
    }

    let mut r = ByteReader::new(data);
    let header = FileHeader::read(&mut r)?;
    let recovery = if header.has_recovery_key() {
        Some(RecoveryBlocks::read(&mut r, header.cipher)?)
    } else {
        None
    };
    let salt: [u8; SALT_SIZE] = r.read_array()?;
    let iv = r.read_bytes(header.cipher.iv_size())?;

    let sealed = r.rest();
    let tag_size = header.tag_size();
    if sealed.len() < tag_size {
        return Err(DbError::format("file too short for authentication tag"));
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - tag_size);
    if ciphertext.len() < InnerHeader::size_for(header.version) {
        return Err(DbError::format("encrypted body too short"));
    }
    if ciphertext.len() % header.cipher.block_size() != 0 {
        return Err(DbError::format("encrypted body not aligned to the cipher block size"));
    }

    // primary block first, then the recovery block
    let attempts = if recovery.is_some() { 2 } else { 1 };
    for attempt in 0..attempts {
        let master_key = match &recovery {
            Some(blocks) if attempt == 0 => blocks.primary.unwrap(key, header.cipher)?,
            Some(blocks) => blocks.recovery.unwrap(key, header.cipher)?,
            None => derive_key(key.as_bytes(), &salt, header.kdf_iterations, None)?,
        };

        if header.version >= VERSION_HMAC {
            let mut auth = Authenticator::new(header.hash, &*master_key);
            authenticate(&mut auth, header.version, &salt, iv, ciphertext);
            if !auth.verify(tag) {
                continue;
            }
        }

        let mut plain = Zeroizing::new(ciphertext.to_vec());
        let mut suite = CipherSuite::new(header.cipher, &master_key);
        suite.set_iv(iv)?;
        suite.decrypt(&mut plain)?;

        let mut pr = ByteReader::new(&plain);
        let inner = match InnerHeader::read(&mut pr, header.version) {
            Ok(inner) => inner,
            // no tag before 0x101, the inner magic is the only key check
            Err(DbError::InvalidKey) if header.version < VERSION_HMAC => continue,
            Err(e) => return Err(e),
        };

        let payload = read_body(&mut pr, &header, &inner, cache)?;
        debug!(
            version = format_args!("{:#x}", header.version),
            entries = payload.entries.len(),
            "database unsealed"
        );
        return Ok(Unsealed {
            master_key: SecureBuffer::from_slice(&*master_key),
            header,
            salt,
            recovery,
            payload,
        });
    }

    Err(DbError::InvalidKey)
}

fn read_body(
    pr: &mut ByteReader<'_>,
    header: &FileHeader,
    inner: &InnerHeader,
    cache: &mut PasswordCache,
) -> Result<Payload> {
    if header.version < VERSION_COMPRESSION {
        // legacy bodies are driven by counts, padding is ignored
        return body::read_payload(pr, header.version, inner, cache);
    }

    let uncompressed_size = u64::from(inner.uncompressed_size);
    if uncompressed_size > MAX_FILE_SIZE {
        return Err(DbError::format("declared payload size too large"));
    }
    match inner.compression {
        Compression::None => {
            let stored = pr.read_bytes(inner.uncompressed_size as usize)?;
            body::read_payload(&mut ByteReader::new(stored), header.version, inner, cache)
        }
        Compression::Deflate { .. } => {
            let stored = pr.read_bytes(inner.compressed_size as usize)?;
            let payload = inflate(stored, uncompressed_size)?;
            body::read_payload(&mut ByteReader::new(&payload), header.version, inner, cache)
        }
    }
}

fn deflate(data: &[u8], level: u8) -> Result<Zeroizing<Vec<u8>>> {
    // stored blocks bound the worst case expansion
    let bound = data.len() + data.len() / 1000 + 64;
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(bound), DeflateLevel::new(u32::from(level)));
    encoder.write_all(data)?;
    Ok(Zeroizing::new(encoder.finish()?))
}

fn inflate(data: &[u8], expected: u64) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(expected as usize + 1));
    DeflateDecoder::new(data)
        .take(expected + 1)
        .read_to_end(&mut out)
        .map_err(|e| DbError::format(format!("corrupt compressed payload: {}", e)))?;
    if out.len() as u64 != expected {
        return Err(DbError::format("decompressed size mismatch"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FORMAT_VERSION;
    use crate::database::header::VERSION_GLOBAL_SETTINGS;
    use crate::database::recovery::KeyBlock;
    use crate::random::{PoolCipher, PoolHandle};

    struct Fixture {
        pool: RandomPool,
        handle: PoolHandle,
        cache: PasswordCache,
        master_key: [u8; KEY_LENGTH],
        salt: [u8; SALT_SIZE],
        entries: Vec<PasswDbEntry>,
        defaults: DbDefaults,
    }

    const ITERATIONS: u32 = 10;

    fn fixture(key: &str) -> Fixture {
        let mut pool = RandomPool::new(PoolCipher::default()).unwrap();
        let mut cache = PasswordCache::new(&mut pool);
        let mut salt = [0u8; SALT_SIZE];
        pool.get_data(&mut salt);
        let master_key = *derive_key(key.as_bytes(), &salt, ITERATIONS, None).unwrap();

        let mut entry = PasswDbEntry::new("bank", "alice");
        entry.id = 1;
        entry.notes = "x".repeat(500);
        entry.passw = Some(cache.seal(1, "p@ss").unwrap());

        Fixture {
            pool,
            handle: PoolHandle::new(PoolCipher::ChaCha8).unwrap(),
            cache,
            master_key,
            salt,
            entries: vec![entry],
            defaults: DbDefaults {
                user_name: "alice".to_string(),
                ..Default::default()
            },
        }
    }

    fn seal_fixture(f: &mut Fixture, version: u16, cipher: CipherId, hash: HashId) -> Vec<u8> {
        let params = SealParams {
            version,
            cipher,
            hash,
            kdf_iterations: ITERATIONS,
            compression_level: Some(6),
            master_key: &f.master_key,
            salt: &f.salt,
            recovery: None,
            defaults: &f.defaults,
            entries: &f.entries,
            cache: &f.cache,
        };
        seal(&params, &mut f.pool).unwrap()
    }

    fn first_passw(unsealed: &Unsealed, cache: &PasswordCache) -> String {
        let entry = &unsealed.payload.entries[0];
        cache.open(entry.id, entry.passw.as_ref().unwrap()).unwrap().to_string()
    }

    #[test]
    fn test_every_version_readable() {
        for version in VERSION_INITIAL..=FORMAT_VERSION {
            for cipher in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
                for hash in [HashId::Sha256, HashId::Sha512] {
                    let mut f = fixture("correct horse");
                    let bytes = seal_fixture(&mut f, version, cipher, hash);
                    let key = CompositeKey::from_passphrase("correct horse");
                    let unsealed = unseal(&bytes, &key, &mut f.cache).unwrap();

                    assert_eq!(unsealed.header.version, version);
                    assert_eq!(unsealed.payload.entries[0].title, "bank");
                    assert_eq!(first_passw(&unsealed, &f.cache), "p@ss");
                    let expected_user = if version >= VERSION_GLOBAL_SETTINGS { "alice" } else { "" };
                    assert_eq!(unsealed.payload.defaults.user_name, expected_user);
                }
            }
        }
    }

    #[test]
    fn test_wrong_key_every_version() {
        for version in VERSION_INITIAL..=FORMAT_VERSION {
            let mut f = fixture("correct horse");
            let bytes = seal_fixture(&mut f, version, CipherId::Aes256Cbc, HashId::Sha512);
            let Err(err) = unseal(&bytes, &CompositeKey::from_passphrase("wrong"), &mut f.cache) else {
                panic!("unseal accepted invalid input");
            };
            assert!(matches!(err, DbError::InvalidKey), "version {:#x}", version);
        }
    }

    #[test]
    fn test_compression_shrinks_body() {
        let mut f = fixture("k");
        let compressed = seal_fixture(&mut f, FORMAT_VERSION, CipherId::ChaCha20, HashId::Sha512);
        let uncompressed = seal_fixture(&mut f, VERSION_RECOVERY_KEY, CipherId::ChaCha20, HashId::Sha512);
        assert!(compressed.len() < uncompressed.len());
    }

    #[test]
    fn test_any_flipped_byte_detected() {
        let mut f = fixture("k");
        let bytes = seal_fixture(&mut f, FORMAT_VERSION, CipherId::Aes256Cbc, HashId::Sha512);
        let key = CompositeKey::from_passphrase("k");
        let start = crate::database::header::FILE_HEADER_SIZE;
        let end = bytes.len() - HashId::Sha512.tag_size();
        for pos in (start..end).step_by(7) {
            let mut tampered = bytes.clone();
            tampered[pos] ^= 0x01;
            let Err(err) = unseal(&tampered, &key, &mut f.cache) else {
                panic!("unseal accepted invalid input");
            };
            assert!(matches!(err, DbError::InvalidKey), "offset {}", pos);
        }
    }

    #[test]
    fn test_header_checked_before_key_derivation() {
        let mut f = fixture("k");
        let mut bytes = seal_fixture(&mut f, FORMAT_VERSION, CipherId::ChaCha20, HashId::Sha512);
        bytes[11] = 9;
        let Err(err) = unseal(&bytes, &CompositeKey::from_passphrase("k"), &mut f.cache) else {
            panic!("unseal accepted invalid input");
        };
        assert!(matches!(err, DbError::InvalidFormat(_)));
    }

    #[test]
    fn test_truncated_file_is_format_error() {
        let mut f = fixture("k");
        let bytes = seal_fixture(&mut f, FORMAT_VERSION, CipherId::Aes256Cbc, HashId::Sha512);
        let Err(err) = unseal(&bytes[..40], &CompositeKey::from_passphrase("k"), &mut f.cache) else {
            panic!("unseal accepted invalid input");
        };
        assert!(matches!(err, DbError::InvalidFormat(_)));
    }

    #[test]
    fn test_recovery_blocks_either_key() {
        let mut f = fixture("primary");
        let cipher = CipherId::ChaCha20;
        let blocks = RecoveryBlocks {
            primary: KeyBlock::wrap(
                &f.master_key,
                &CompositeKey::from_passphrase("primary"),
                cipher,
                ITERATIONS,
                &f.handle,
                None,
            )
            .unwrap(),
            recovery: KeyBlock::wrap(
                &f.master_key,
                &CompositeKey::from_passphrase("recovery"),
                cipher,
                ITERATIONS,
                &f.handle,
                None,
            )
            .unwrap(),
        };
        let params = SealParams {
            version: FORMAT_VERSION,
            cipher,
            hash: HashId::Sha512,
            kdf_iterations: ITERATIONS,
            compression_level: None,
            master_key: &f.master_key,
            salt: &f.salt,
            recovery: Some(&blocks),
            defaults: &f.defaults,
            entries: &f.entries,
            cache: &f.cache,
        };
        let bytes = seal(&params, &mut f.pool).unwrap();

        for phrase in ["primary", "recovery"] {
            let unsealed = unseal(&bytes, &CompositeKey::from_passphrase(phrase), &mut f.cache).unwrap();
            assert!(unsealed.header.has_recovery_key());
            assert_eq!(unsealed.master_key.as_bytes(), &f.master_key);
        }
        assert!(matches!(
            unseal(&bytes, &CompositeKey::from_passphrase("other"), &mut f.cache),
            Err(DbError::InvalidKey)
        ));
    }

    #[test]
    fn test_recovery_needs_version() {
        let mut f = fixture("k");
        let block = KeyBlock::wrap(
            &f.master_key,
            &CompositeKey::from_passphrase("k"),
            CipherId::ChaCha20,
            1,
            &f.handle,
            None,
        )
        .unwrap();
        let blocks = RecoveryBlocks {
            primary: block.clone(),
            recovery: block,
        };
        let params = SealParams {
            version: VERSION_GLOBAL_SETTINGS,
            cipher: CipherId::ChaCha20,
            hash: HashId::Sha512,
            kdf_iterations: 1,
            compression_level: None,
            master_key: &f.master_key,
            salt: &f.salt,
            recovery: Some(&blocks),
            defaults: &f.defaults,
            entries: &f.entries,
            cache: &f.cache,
        };
        assert!(matches!(seal(&params, &mut f.pool), Err(DbError::InvalidOperation(_))));
    }

    #[test]
    fn test_inflate_rejects_size_mismatch() {
        let packed = deflate(b"hello hello hello", 6).unwrap();
        assert!(inflate(&packed, 17).is_ok());
        assert!(inflate(&packed, 5).is_err());
        assert!(inflate(b"not deflate data", 10).is_err());
    }
}
