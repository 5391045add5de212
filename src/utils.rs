// Utility functions
use chrono::{DateTime, SecondsFormat, Utc};

/// Parses an RFC 3339 string into `DateTime<Utc>`, if possible.
pub fn parse_datetime(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(date_str)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Formats a timestamp the way it is stored: RFC 3339, millisecond precision, `Z` suffix.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// True when `level` lies on the path from `from` to `to`, endpoints included.
pub fn spans(from: f64, to: f64, level: f64) -> bool {
    let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
    lo <= level && level <= hi
}
