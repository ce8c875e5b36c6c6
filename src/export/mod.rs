//! Export of database entries
//!
//! CSV with RFC 4180 quoting, and JSON through [`ExportEntry`]. Passwords are
//! written only when explicitly requested.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

use crate::database::PasswDatabase;
use crate::error::{DbError, Result};
use crate::utils::format_datetime;

/// CSV column order
pub const CSV_COLUMNS: [&str; 11] = [
    "title",
    "user_name",
    "password",
    "url",
    "keyword",
    "notes",
    "tags",
    "expiry_date",
    "creation_time",
    "modification_time",
    "passw_change_time",
];

/// Export options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvExportOptions {
    /// Write decrypted passwords, otherwise the column stays empty
    pub include_passwords: bool,
    /// Write the header line
    pub include_header: bool,
}

impl Default for CsvExportOptions {
    fn default() -> Self {
        Self {
            include_passwords: false,
            include_header: true,
        }
    }
}

/// One exported entry
///
/// The password, if present, is wiped when the entry is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub title: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub url: String,
    pub keyword: String,
    pub notes: String,
    pub tags: Vec<String>,
    pub key_value_list: Vec<(String, String)>,
    pub expiry_date: Option<String>,
    pub creation_time: String,
    pub modification_time: String,
    pub passw_change_time: String,
}

impl Drop for ExportEntry {
    fn drop(&mut self) {
        if let Some(password) = &mut self.password {
            password.zeroize();
        }
    }
}

/// Collect the entries of an open database
pub fn export_entries(db: &PasswDatabase, include_passwords: bool) -> Result<Vec<ExportEntry>> {
    if !db.is_open() {
        return Err(DbError::NotOpen);
    }

    let mut out = Vec::with_capacity(db.num_entries());
    for (index, entry) in db.entries().iter().enumerate() {
        let password = if include_passwords {
            Some(db.get_db_entry_passw(index)?.to_string())
        } else {
            None
        };
        out.push(ExportEntry {
            title: entry.title.clone(),
            user_name: entry.user_name.clone(),
            password,
            url: entry.url.clone(),
            keyword: entry.keyword.clone(),
            notes: entry.notes.clone(),
            tags: entry.tags.clone(),
            key_value_list: entry.key_value_list.clone(),
            expiry_date: entry.expiry_date.map(|d| d.to_string()),
            creation_time: format_datetime(&entry.creation_time),
            modification_time: format_datetime(&entry.modification_time),
            passw_change_time: format_datetime(&entry.passw_change_time),
        });
    }
    Ok(out)
}

/// Write all entries as CSV
pub fn export_csv<W: Write>(db: &PasswDatabase, writer: &mut W, options: CsvExportOptions) -> Result<()> {
    let entries = export_entries(db, options.include_passwords)?;

    if options.include_header {
        write_record(writer, CSV_COLUMNS.iter().copied())?;
    }
    for entry in &entries {
        let tags = entry.tags.join(";");
        let expiry = entry.expiry_date.as_deref().unwrap_or("");
        let password = entry.password.as_deref().unwrap_or("");
        write_record(
            writer,
            [
                entry.title.as_str(),
                entry.user_name.as_str(),
                password,
                entry.url.as_str(),
                entry.keyword.as_str(),
                entry.notes.as_str(),
                tags.as_str(),
                expiry,
                entry.creation_time.as_str(),
                entry.modification_time.as_str(),
                entry.passw_change_time.as_str(),
            ],
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Write all entries as CSV to `path`
pub fn export_csv_to_file(db: &PasswDatabase, path: &Path, options: CsvExportOptions) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    export_csv(db, &mut writer, options)?;
    info!(
        path = %path.display(),
        entries = db.num_entries(),
        passwords = options.include_passwords,
        "entries exported to CSV"
    );
    Ok(())
}

/// Pretty-printed JSON array of all entries
pub fn export_json(db: &PasswDatabase, include_passwords: bool) -> Result<Zeroizing<String>> {
    let entries = export_entries(db, include_passwords)?;
    let mut out = Zeroizing::new(Vec::with_capacity(entries.len() * 512));
    serde_json::to_writer_pretty(&mut *out, &entries).map_err(|e| DbError::InvalidOperation(e.to_string()))?;
    String::from_utf8(std::mem::take(&mut *out))
        .map(Zeroizing::new)
        .map_err(|e| DbError::InvalidOperation(e.to_string()))
}

fn write_record<'a, W, I>(writer: &mut W, fields: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a str>,
{
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            writer.write_all(b",")?;
        }
        let escaped = escape_csv(field);
        let written = writer.write_all(escaped.as_bytes());
        if let Cow::Owned(mut quoted) = escaped {
            quoted.zeroize();
        }
        written?;
    }
    writer.write_all(b"\r\n")?;
    Ok(())
}

/// Quote a field if it contains a separator, quote or line break
pub fn escape_csv(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}
