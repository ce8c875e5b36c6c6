//! Data models for password database entries

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::memory::SealedPassword;
use crate::utils::now;

/// Semantic field of an entry as named in the file's field table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldId {
    Title,
    UserName,
    Password,
    Url,
    Keyword,
    Notes,
    KeyValueList,
    Tags,
    CreationTime,
    ModificationTime,
    PasswChangeTime,
    ExpiryDate,
    PasswHistory,
    Id,
}

impl FieldId {
    /// All fields in the order the writer emits them
    pub const ALL: [FieldId; 14] = [
        FieldId::Title,
        FieldId::UserName,
        FieldId::Password,
        FieldId::Url,
        FieldId::Keyword,
        FieldId::Notes,
        FieldId::KeyValueList,
        FieldId::Tags,
        FieldId::CreationTime,
        FieldId::ModificationTime,
        FieldId::PasswChangeTime,
        FieldId::ExpiryDate,
        FieldId::PasswHistory,
        FieldId::Id,
    ];

    /// Name stored in the field table
    pub fn name(self) -> &'static str {
        match self {
            FieldId::Title => "TITLE",
            FieldId::UserName => "USERNAME",
            FieldId::Password => "PASSWORD",
            FieldId::Url => "URL",
            FieldId::Keyword => "KEYWORD",
            FieldId::Notes => "NOTES",
            FieldId::KeyValueList => "KEYVALUELIST",
            FieldId::Tags => "TAGS",
            FieldId::CreationTime => "CREATIONTIME",
            FieldId::ModificationTime => "MODIFICATIONTIME",
            FieldId::PasswChangeTime => "PASSWCHANGETIME",
            FieldId::ExpiryDate => "EXPIRYDATE",
            FieldId::PasswHistory => "PASSWHISTORY",
            FieldId::Id => "ID",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Entries without this field are rejected
    pub fn is_required(self) -> bool {
        matches!(self, FieldId::Title | FieldId::UserName | FieldId::Password)
    }
}

/// Calendar date packed as `year << 16 | month << 8 | day`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExpiryDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl ExpiryDate {
    /// Build a date, `None` if it does not exist in the calendar
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?;
        Some(Self { year, month, day })
    }

    pub fn from_packed(value: u32) -> Option<Self> {
        Self::new((value >> 16) as u16, (value >> 8) as u8, value as u8)
    }

    pub fn packed(self) -> u32 {
        (u32::from(self.year) << 16) | (u32::from(self.month) << 8) | u32::from(self.day)
    }

    pub fn from_naive_date(date: NaiveDate) -> Option<Self> {
        let year = u16::try_from(date.year()).ok()?;
        Some(Self {
            year,
            month: date.month() as u8,
            day: date.day() as u8,
        })
    }

    pub fn to_naive_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(i32::from(self.year), u32::from(self.month), u32::from(self.day))
    }

    /// True once `today` has reached the expiry date
    pub fn is_expired(self, today: NaiveDate) -> bool {
        self.to_naive_date().is_some_and(|d| d <= today)
    }
}

impl std::fmt::Display for ExpiryDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Previous password with the time it was set
#[derive(Clone, Serialize, Deserialize)]
pub struct PasswHistoryEntry {
    pub time: DateTime<Utc>,
    pub passw: String,
}

impl Drop for PasswHistoryEntry {
    fn drop(&mut self) {
        self.passw.zeroize();
    }
}

impl std::fmt::Debug for PasswHistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswHistoryEntry")
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// Bounded password history, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PasswHistory {
    pub enabled: bool,
    max_size: u32,
    entries: Vec<PasswHistoryEntry>,
}

impl PasswHistory {
    pub fn new(enabled: bool, max_size: u32) -> Self {
        Self {
            enabled,
            max_size,
            entries: Vec::new(),
        }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Change the cap, dropping the oldest entries beyond it
    pub fn set_max_size(&mut self, max_size: u32) {
        self.max_size = max_size;
        self.entries.truncate(max_size as usize);
    }

    pub fn entries(&self) -> &[PasswHistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a superseded password; ignored while disabled
    pub fn push(&mut self, time: DateTime<Utc>, passw: &str) {
        if !self.enabled || self.max_size == 0 {
            return;
        }
        self.entries.insert(
            0,
            PasswHistoryEntry {
                time,
                passw: passw.to_string(),
            },
        );
        self.entries.truncate(self.max_size as usize);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rebuild from stored parts, oldest entries beyond the cap are dropped
    pub(crate) fn from_parts(enabled: bool, max_size: u32, mut entries: Vec<PasswHistoryEntry>) -> Self {
        entries.truncate(max_size as usize);
        Self {
            enabled,
            max_size,
            entries,
        }
    }
}

/// Database-wide defaults, stored as tagged global settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbDefaults {
    /// User name filled into new entries
    pub user_name: String,
    /// Password format sequence handed to the password generator
    pub passw_format_seq: String,
    /// Days until a new entry expires, 0 for never
    pub expiry_days: u32,
    /// History depth for new entries, 0 to disable
    pub passw_history_size: u32,
}

/// One credential record
///
/// The password is not a public field: it is kept sealed by the owning
/// database and accessed through
/// [`PasswDatabase::get_db_entry_passw`](crate::PasswDatabase::get_db_entry_passw).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswDbEntry {
    pub title: String,
    pub user_name: String,
    pub url: String,
    pub keyword: String,
    pub notes: String,
    pub key_value_list: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub passw_change_time: DateTime<Utc>,
    pub expiry_date: Option<ExpiryDate>,
    pub passw_history: PasswHistory,
    pub(crate) id: u32,
    pub(crate) index: usize,
    #[serde(skip)]
    pub(crate) passw: Option<SealedPassword>,
}

impl Default for PasswDbEntry {
    fn default() -> Self {
        let now = now();
        Self {
            title: String::new(),
            user_name: String::new(),
            url: String::new(),
            keyword: String::new(),
            notes: String::new(),
            key_value_list: Vec::new(),
            tags: Vec::new(),
            creation_time: now,
            modification_time: now,
            passw_change_time: now,
            expiry_date: None,
            passw_history: PasswHistory::default(),
            id: 0,
            index: 0,
            passw: None,
        }
    }
}

impl PasswDbEntry {
    /// New entry with the given title and user name
    pub fn new(title: &str, user_name: &str) -> Self {
        Self {
            title: title.to_string(),
            user_name: user_name.to_string(),
            ..Default::default()
        }
    }

    /// Stable identity, assigned when the entry is added to a database
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current 0-based position in the database
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn has_passw(&self) -> bool {
        self.passw.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Length of the stored password in bytes
    pub fn passw_len(&self) -> usize {
        self.passw.as_ref().map_or(0, SealedPassword::len)
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|d| d.is_expired(today))
    }

    /// Value of `key` in the key-value list
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.key_value_list
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn touch(&mut self) {
        self.modification_time = now();
    }
}
