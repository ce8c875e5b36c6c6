//! Common utility functions

use chrono::{DateTime, SubsecRound, Utc};

/// Date-time format used in exports
pub const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Convert DateTime to export string format
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format(EXPORT_DATE_FORMAT).to_string()
}

/// Current UTC time at the precision stored in database files
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Microseconds since the Unix epoch
pub fn to_micros(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

/// Inverse of [`to_micros`]; `None` if out of chrono's range
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Compare two byte strings without an early exit on the first difference
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}
