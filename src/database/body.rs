//! Payload encoding: field table, global settings and tagged entries
//!
//! Each entry is a run of `(index:u8, len:u32, bytes)` tuples closed by
//! [`END_OF_ENTRY`]. Indices refer to the per-file field table, so fields the
//! reader does not know are skipped by length.

use std::collections::HashSet;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{DbError, Result};
use crate::memory::PasswordCache;
use crate::utils::{from_micros, to_micros};

use super::codec::{ByteReader, ByteWriter, checked_len};
use super::header::{InnerHeader, VERSION_GLOBAL_SETTINGS};
use super::models::{DbDefaults, ExpiryDate, FieldId, PasswDbEntry, PasswHistory, PasswHistoryEntry};

/// Terminates the field run of one entry
pub const END_OF_ENTRY: u8 = 0xff;

const SETTING_USER_NAME: u8 = 0;
const SETTING_PASSW_FORMAT_SEQ: u8 = 1;
const SETTING_EXPIRY_DAYS: u8 = 2;
const SETTING_PASSW_HISTORY_SIZE: u8 = 3;
const NUM_SETTINGS: u8 = 4;

/// Decoded payload
pub(crate) struct Payload {
    pub defaults: DbDefaults,
    pub entries: Vec<PasswDbEntry>,
}

/// Number of global settings the writer emits for `version`
pub(crate) fn settings_count(version: u16) -> u8 {
    if version >= VERSION_GLOBAL_SETTINGS { NUM_SETTINGS } else { 0 }
}

/// Encode defaults and entries, reading passwords out of `cache`
pub(crate) fn write_payload(
    w: &mut ByteWriter,
    version: u16,
    defaults: &DbDefaults,
    entries: &[PasswDbEntry],
    cache: &PasswordCache,
) -> Result<()> {
    for field in FieldId::ALL {
        let name = field.name().as_bytes();
        w.put_u8(name.len() as u8);
        w.put_bytes(name);
    }

    if settings_count(version) > 0 {
        write_setting(w, SETTING_USER_NAME, defaults.user_name.as_bytes())?;
        write_setting(w, SETTING_PASSW_FORMAT_SEQ, defaults.passw_format_seq.as_bytes())?;
        write_setting(w, SETTING_EXPIRY_DAYS, &defaults.expiry_days.to_le_bytes())?;
        write_setting(
            w,
            SETTING_PASSW_HISTORY_SIZE,
            &defaults.passw_history_size.to_le_bytes(),
        )?;
    }

    for entry in entries {
        write_entry(w, entry, cache)?;
    }
    Ok(())
}

fn write_setting(w: &mut ByteWriter, id: u8, value: &[u8]) -> Result<()> {
    w.put_u8(id);
    w.put_len_prefixed(value)
}

/// Field index as written: position in [`FieldId::ALL`]
fn field_index(field: FieldId) -> u8 {
    FieldId::ALL.iter().position(|&f| f == field).unwrap_or_default() as u8
}

fn put_field(w: &mut ByteWriter, field: FieldId, value: &[u8]) -> Result<()> {
    w.put_u8(field_index(field));
    w.put_len_prefixed(value)
}

fn write_entry(w: &mut ByteWriter, entry: &PasswDbEntry, cache: &PasswordCache) -> Result<()> {
    put_field(w, FieldId::Title, entry.title.as_bytes())?;
    put_field(w, FieldId::UserName, entry.user_name.as_bytes())?;

    let passw = match &entry.passw {
        Some(sealed) => cache.open(entry.id, sealed)?,
        None => Zeroizing::new(String::new()),
    };
    put_field(w, FieldId::Password, passw.as_bytes())?;
    drop(passw);

    for (field, value) in [
        (FieldId::Url, &entry.url),
        (FieldId::Keyword, &entry.keyword),
        (FieldId::Notes, &entry.notes),
    ] {
        if !value.is_empty() {
            put_field(w, field, value.as_bytes())?;
        }
    }

    if !entry.key_value_list.is_empty() {
        let mut list = ByteWriter::new();
        for (key, value) in &entry.key_value_list {
            list.put_len_prefixed(key.as_bytes())?;
            list.put_len_prefixed(value.as_bytes())?;
        }
        put_field(w, FieldId::KeyValueList, &list.into_inner())?;
    }

    if !entry.tags.is_empty() {
        let mut tags = ByteWriter::new();
        for tag in &entry.tags {
            tags.put_len_prefixed(tag.as_bytes())?;
        }
        put_field(w, FieldId::Tags, &tags.into_inner())?;
    }

    put_field(w, FieldId::CreationTime, &to_micros(&entry.creation_time).to_le_bytes())?;
    put_field(
        w,
        FieldId::ModificationTime,
        &to_micros(&entry.modification_time).to_le_bytes(),
    )?;
    put_field(
        w,
        FieldId::PasswChangeTime,
        &to_micros(&entry.passw_change_time).to_le_bytes(),
    )?;

    if let Some(expiry) = entry.expiry_date {
        put_field(w, FieldId::ExpiryDate, &expiry.packed().to_le_bytes())?;
    }

    let history = &entry.passw_history;
    if history.enabled || history.max_size() != 0 {
        let mut h = ByteWriter::new();
        h.put_u8(u8::from(history.enabled));
        h.put_u32(history.max_size());
        h.put_u32(checked_len(history.len())?);
        for item in history.entries() {
            h.put_i64(to_micros(&item.time));
            h.put_len_prefixed(item.passw.as_bytes())?;
        }
        put_field(w, FieldId::PasswHistory, &h.into_inner())?;
    }

    put_field(w, FieldId::Id, &entry.id.to_le_bytes())?;
    w.put_u8(END_OF_ENTRY);
    Ok(())
}

/// Decode the payload, sealing every password into `cache`
pub(crate) fn read_payload(
    r: &mut ByteReader<'_>,
    version: u16,
    header: &InnerHeader,
    cache: &mut PasswordCache,
) -> Result<Payload> {
    let mut table = Vec::with_capacity(header.num_fields as usize);
    for _ in 0..header.num_fields {
        let len = r.read_u8()? as usize;
        let name = r.read_bytes(len)?;
        let field = std::str::from_utf8(name).ok().and_then(FieldId::from_name);
        if field.is_none() {
            debug!(name = %String::from_utf8_lossy(name), "unknown field in table");
        }
        table.push(field);
    }
    for required in [FieldId::Title, FieldId::UserName, FieldId::Password] {
        if !table.contains(&Some(required)) {
            return Err(DbError::format(format!("field table lacks {}", required.name())));
        }
    }

    let mut defaults = DbDefaults::default();
    if version >= VERSION_GLOBAL_SETTINGS {
        for _ in 0..header.num_variable_params {
            let id = r.read_u8()?;
            let value = r.read_len_prefixed()?;
            read_setting(&mut defaults, id, value)?;
        }
    }

    // each entry needs at least its END marker
    if header.num_entries as usize > r.remaining() {
        return Err(DbError::format("entry count exceeds payload size"));
    }

    let mut entries = Vec::with_capacity(header.num_entries as usize);
    let mut passwords = Vec::with_capacity(header.num_entries as usize);
    let mut ids: Vec<Option<u32>> = Vec::with_capacity(header.num_entries as usize);
    for _ in 0..header.num_entries {
        let (entry, passw, id) = read_entry(r, &table)?;
        entries.push(entry);
        passwords.push(passw);
        ids.push(id);
    }

    assign_ids(&mut entries, &ids)?;
    for (index, (entry, passw)) in entries.iter_mut().zip(passwords).enumerate() {
        entry.index = index;
        entry.passw = Some(cache.seal(entry.id, &passw)?);
    }

    Ok(Payload { defaults, entries })
}

fn read_setting(defaults: &mut DbDefaults, id: u8, value: &[u8]) -> Result<()> {
    match id {
        SETTING_USER_NAME => defaults.user_name = utf8(value)?,
        SETTING_PASSW_FORMAT_SEQ => defaults.passw_format_seq = utf8(value)?,
        SETTING_EXPIRY_DAYS => defaults.expiry_days = fixed_u32(value)?,
        SETTING_PASSW_HISTORY_SIZE => defaults.passw_history_size = fixed_u32(value)?,
        other => debug!(id = other, "skipping unknown global setting"),
    }
    Ok(())
}

/// Entry, its plaintext password and its stored id (absent in old files)
fn read_entry(
    r: &mut ByteReader<'_>,
    table: &[Option<FieldId>],
) -> Result<(PasswDbEntry, Zeroizing<String>, Option<u32>)> {
    let mut entry = PasswDbEntry::default();
    let mut passw = Zeroizing::new(String::new());
    let mut id = None;
    let mut seen = HashSet::new();

    loop {
        let index = r.read_u8()?;
        if index == END_OF_ENTRY {
            break;
        }
        let value = r.read_len_prefixed()?;

        let Some(field) = table.get(index as usize).copied().flatten() else {
            continue;
        };
        seen.insert(field);

        match field {
            FieldId::Title => entry.title = utf8(value)?,
            FieldId::UserName => entry.user_name = utf8(value)?,
            FieldId::Password => passw = Zeroizing::new(utf8(value)?),
            FieldId::Url => entry.url = utf8(value)?,
            FieldId::Keyword => entry.keyword = utf8(value)?,
            FieldId::Notes => entry.notes = utf8(value)?,
            FieldId::KeyValueList => entry.key_value_list = read_key_value_list(value)?,
            FieldId::Tags => entry.tags = read_string_list(value)?,
            FieldId::CreationTime => entry.creation_time = timestamp(value)?,
            FieldId::ModificationTime => entry.modification_time = timestamp(value)?,
            FieldId::PasswChangeTime => entry.passw_change_time = timestamp(value)?,
            FieldId::ExpiryDate => {
                entry.expiry_date = Some(
                    ExpiryDate::from_packed(fixed_u32(value)?)
                        .ok_or_else(|| DbError::format("invalid expiry date"))?,
                )
            }
            FieldId::PasswHistory => entry.passw_history = read_history(value)?,
            FieldId::Id => id = Some(fixed_u32(value)?),
        }
    }

    for required in [FieldId::Title, FieldId::UserName, FieldId::Password] {
        if !seen.contains(&required) {
            return Err(DbError::format(format!("entry lacks {}", required.name())));
        }
    }
    Ok((entry, passw, id))
}

/// Keep stored ids, number entries from old files after the highest one
fn assign_ids(entries: &mut [PasswDbEntry], ids: &[Option<u32>]) -> Result<()> {
    let mut used = HashSet::new();
    for id in ids.iter().flatten() {
        if !used.insert(*id) {
            return Err(DbError::format(format!("duplicate entry id {}", id)));
        }
    }

    let mut next = ids.iter().flatten().max().and_then(|max| max.checked_add(1)).unwrap_or(0);
    for (entry, id) in entries.iter_mut().zip(ids) {
        entry.id = match id {
            Some(id) => *id,
            None => {
                let id = next_free_id(&used, next).ok_or_else(|| DbError::format("entry ids exhausted"))?;
                used.insert(id);
                next = id.checked_add(1).unwrap_or(0);
                id
            }
        };
    }

    if ids.iter().any(Option::is_none) {
        warn!("entries without stored ids were renumbered");
    }
    Ok(())
}

/// First id not in `used`, searching upwards from `from` and then from zero
pub(super) fn next_free_id(used: &HashSet<u32>, from: u32) -> Option<u32> {
    (from..=u32::MAX).chain(0..from).find(|id| !used.contains(id))
}

fn utf8(value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| DbError::format("invalid UTF-8 in field"))
}

fn fixed_u32(value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| DbError::format(format!("expected 4 bytes, got {}", value.len())))?;
    Ok(u32::from_le_bytes(bytes))
}

fn timestamp(value: &[u8]) -> Result<chrono::DateTime<chrono::Utc>> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| DbError::format(format!("expected 8-byte timestamp, got {}", value.len())))?;
    from_micros(i64::from_le_bytes(bytes)).ok_or_else(|| DbError::format("timestamp out of range"))
}

fn read_string_list(value: &[u8]) -> Result<Vec<String>> {
    let mut r = ByteReader::new(value);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(utf8(r.read_len_prefixed()?)?);
    }
    Ok(out)
}

fn read_key_value_list(value: &[u8]) -> Result<Vec<(String, String)>> {
    let mut r = ByteReader::new(value);
    let mut out = Vec::new();
    while !r.is_empty() {
        let key = utf8(r.read_len_prefixed()?)?;
        let val = utf8(r.read_len_prefixed()?)?;
        out.push((key, val));
    }
    Ok(out)
}

fn read_history(value: &[u8]) -> Result<PasswHistory> {
    let mut r = ByteReader::new(value);
    let enabled = r.read_u8()? != 0;
    let max_size = r.read_u32()?;
    let count = r.read_u32()? as usize;
    // 12 bytes minimum per item
    if count > r.remaining() / 12 {
        return Err(DbError::format("history count exceeds field size"));
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let time = from_micros(r.read_i64()?)
            .ok_or_else(|| DbError::format("timestamp out of range"))?;
        let passw = utf8(r.read_len_prefixed()?)?;
        items.push(PasswHistoryEntry { time, passw });
    }
    Ok(PasswHistory::from_parts(enabled, max_size, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::header::{Compression, VERSION_COMPRESSION, VERSION_INITIAL};
    use crate::random::{PoolCipher, RandomPool};
    use crate::utils::now;

    fn cache() -> PasswordCache {
        let mut pool = RandomPool::new(PoolCipher::default()).unwrap();
        PasswordCache::new(&mut pool)
    }

    fn inner(num_fields: u8, num_variable_params: u8, num_entries: u32) -> InnerHeader {
        InnerHeader {
            flags: 0,
            num_variable_params,
            num_fields,
            num_entries,
            compression: Compression::None,
            uncompressed_size: 0,
            compressed_size: 0,
        }
    }

    fn sample_entry(cache: &mut PasswordCache, id: u32) -> PasswDbEntry {
        let mut entry = PasswDbEntry::new("bänk ✓", "alice");
        entry.id = id;
        entry.url = "https://example.org".to_string();
        entry.notes = "line one\nline two".to_string();
        entry.key_value_list = vec![("pin".to_string(), "0000".to_string())];
        entry.tags = vec!["finance".to_string(), "🏦".to_string()];
        entry.expiry_date = ExpiryDate::new(2030, 1, 31);
        entry.passw_history = PasswHistory::new(true, 3);
        entry.passw_history.push(now(), "old-pass");
        entry.passw = Some(cache.seal(id, "p@ss").unwrap());
        entry
    }

    #[test]
    fn test_payload_roundtrip() {
        let mut cache = cache();
        let defaults = DbDefaults {
            user_name: "alice".to_string(),
            passw_format_seq: "-L16 -Ls".to_string(),
            expiry_days: 90,
            passw_history_size: 5,
        };
        let entries = vec![sample_entry(&mut cache, 4), sample_entry(&mut cache, 9)];

        let mut w = ByteWriter::new();
        write_payload(&mut w, VERSION_COMPRESSION, &defaults, &entries, &cache).unwrap();
        let bytes = w.into_inner();

        let header = inner(14, 4, 2);
        let payload =
            read_payload(&mut ByteReader::new(&bytes), VERSION_COMPRESSION, &header, &mut cache)
                .unwrap();

        assert_eq!(payload.defaults, defaults);
        assert_eq!(payload.entries.len(), 2);
        for (i, (read, orig)) in payload.entries.iter().zip(&entries).enumerate() {
            assert_eq!(read.index, i);
            assert_eq!(read.id, orig.id);
            assert_eq!(read.title, orig.title);
            assert_eq!(read.url, orig.url);
            assert_eq!(read.notes, orig.notes);
            assert_eq!(read.key_value_list, orig.key_value_list);
            assert_eq!(read.tags, orig.tags);
            assert_eq!(read.creation_time, orig.creation_time);
            assert_eq!(read.expiry_date, orig.expiry_date);
            assert_eq!(read.passw_history.len(), 1);
            assert_eq!(read.passw_history.entries()[0].passw, "old-pass");
            let passw = cache.open(read.id, read.passw.as_ref().unwrap()).unwrap();
            assert_eq!(passw.as_str(), "p@ss");
        }
    }

    #[test]
    fn test_unknown_field_skipped_by_length() {
        let mut cache = cache();
        let mut w = ByteWriter::new();
        for name in ["TITLE", "FAVICON", "USERNAME", "PASSWORD"] {
            w.put_u8(name.len() as u8);
            w.put_bytes(name.as_bytes());
        }
        w.put_u8(0);
        w.put_len_prefixed(b"mail").unwrap();
        w.put_u8(1);
        // an END byte inside the unknown payload must not end the entry
        w.put_len_prefixed(&[END_OF_ENTRY, 0, 1, 2]).unwrap();
        w.put_u8(2);
        w.put_len_prefixed(b"bob").unwrap();
        w.put_u8(3);
        w.put_len_prefixed(b"pw").unwrap();
        // index beyond the table
        w.put_u8(40);
        w.put_len_prefixed(b"?").unwrap();
        w.put_u8(END_OF_ENTRY);
        let bytes = w.into_inner();

        let payload = read_payload(
            &mut ByteReader::new(&bytes),
            VERSION_INITIAL,
            &inner(4, 0, 1),
            &mut cache,
        )
        .unwrap();
        let entry = &payload.entries[0];
        assert_eq!(entry.title, "mail");
        assert_eq!(entry.user_name, "bob");
        assert_eq!(entry.id, 0);
        assert_eq!(cache.open(0, entry.passw.as_ref().unwrap()).unwrap().as_str(), "pw");
    }

    #[test]
    fn test_missing_required_field() {
        let mut cache = cache();
        let mut w = ByteWriter::new();
        for name in ["TITLE", "USERNAME", "PASSWORD"] {
            w.put_u8(name.len() as u8);
            w.put_bytes(name.as_bytes());
        }
        w.put_u8(0);
        w.put_len_prefixed(b"only title").unwrap();
        w.put_u8(END_OF_ENTRY);
        let bytes = w.into_inner();

        let result = read_payload(
            &mut ByteReader::new(&bytes),
            VERSION_INITIAL,
            &inner(3, 0, 1),
            &mut cache,
        );
        assert!(matches!(result, Err(DbError::InvalidFormat(_))));
    }

    #[test]
    fn test_unknown_setting_skipped() {
        let mut cache = cache();
        let mut w = ByteWriter::new();
        for field in FieldId::ALL {
            w.put_u8(field.name().len() as u8);
            w.put_bytes(field.name().as_bytes());
        }
        write_setting(&mut w, 77, b"future").unwrap();
        write_setting(&mut w, SETTING_EXPIRY_DAYS, &30u32.to_le_bytes()).unwrap();
        let bytes = w.into_inner();

        let payload = read_payload(
            &mut ByteReader::new(&bytes),
            VERSION_COMPRESSION,
            &inner(14, 2, 0),
            &mut cache,
        )
        .unwrap();
        assert_eq!(payload.defaults.expiry_days, 30);
        assert!(payload.entries.is_empty());
    }

    #[test]
    fn test_truncated_entry_rejected() {
        let mut cache = cache();
        let entries = vec![sample_entry(&mut cache, 1)];
        let mut w = ByteWriter::new();
        write_payload(&mut w, VERSION_COMPRESSION, &DbDefaults::default(), &entries, &cache).unwrap();
        let bytes = w.into_inner();
        let cut = &bytes[..bytes.len() - 3];

        let result = read_payload(
            &mut ByteReader::new(cut),
            VERSION_COMPRESSION,
            &inner(14, 4, 1),
            &mut cache,
        );
        assert!(matches!(result, Err(DbError::InvalidFormat(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut cache = cache();
        let entries = vec![sample_entry(&mut cache, 5), sample_entry(&mut cache, 5)];
        let mut w = ByteWriter::new();
        write_payload(&mut w, VERSION_COMPRESSION, &DbDefaults::default(), &entries, &cache).unwrap();
        let bytes = w.into_inner();

        assert!(read_payload(
            &mut ByteReader::new(&bytes),
            VERSION_COMPRESSION,
            &inner(14, 4, 2),
            &mut cache,
        )
        .is_err());
    }

    #[test]
    fn test_missing_ids_skip_used_ones() {
        let mut entries: Vec<_> = (0..4).map(|_| PasswDbEntry::new("t", "u")).collect();
        let ids = [Some(u32::MAX), None, Some(0), None];
        assign_ids(&mut entries, &ids).unwrap();
        let assigned: Vec<u32> = entries.iter().map(|e| e.id).collect();
        assert_eq!(assigned, vec![u32::MAX, 1, 0, 2]);
    }

    #[test]
    fn test_next_free_id_wraps() {
        let used: HashSet<u32> = [u32::MAX, 0, 1].into_iter().collect();
        assert_eq!(next_free_id(&used, u32::MAX), Some(2));
        assert_eq!(next_free_id(&used, 7), Some(7));
        assert_eq!(next_free_id(&HashSet::new(), 0), Some(0));
    }

    #[test]
    fn test_disabled_history_keeps_size() {
        let mut cache = cache();
        let mut entry = sample_entry(&mut cache, 3);
        entry.passw_history = PasswHistory::new(false, 5);
        let mut w = ByteWriter::new();
        write_payload(&mut w, VERSION_COMPRESSION, &DbDefaults::default(), &[entry], &cache).unwrap();
        let bytes = w.into_inner();

        let payload = read_payload(
            &mut ByteReader::new(&bytes),
            VERSION_COMPRESSION,
            &inner(14, 4, 1),
            &mut cache,
        )
        .unwrap();
        let history = &payload.entries[0].passw_history;
        assert!(!history.enabled);
        assert_eq!(history.max_size(), 5);
        assert!(history.is_empty());
    }
}
