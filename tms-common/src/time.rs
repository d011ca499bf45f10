//! Timestamp utilities
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z` suffix)
//! so that SQL string comparison orders them chronologically.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db_string(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time formatted for storage
pub fn now_db_string() -> String {
    to_db_string(now())
}

/// Parse a stored timestamp
pub fn parse_db_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", s, e)))
}

/// Absolute distance between two calendar dates in whole days
pub fn whole_days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_string_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(123_456);
        assert_eq!(to_db_string(a), "2026-01-02T03:04:05.000000Z");
        assert_eq!(to_db_string(a).len(), to_db_string(b).len());
        assert!(to_db_string(a) < to_db_string(b));
    }

    #[test]
    fn test_parse_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        assert_eq!(parse_db_timestamp(&to_db_string(ts)).unwrap(), ts);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_db_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_whole_days_between_is_symmetric() {
        let a = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let b = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        assert_eq!(whole_days_between(a, b), 10);
        assert_eq!(whole_days_between(b, a), 10);
        assert_eq!(whole_days_between(a, a), 0);
    }
}
