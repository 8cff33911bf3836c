//! Record field conventions and timestamp parsing.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;

/// Field map of a single hash record.
pub type Fields = HashMap<String, String>;

/// Canonical creation timestamp field.
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Alternate spellings of the creation timestamp, checked in order after
/// [`CREATED_AT_FIELD`].
pub const CREATED_AT_ALIASES: [&str; 2] = ["created_at", "timestamp"];

/// Numeric progress field carried as a string in the store.
pub const PROGRESS_FIELD: &str = "bonding_curve_progress";

/// Epoch values at or above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a stored timestamp.
///
/// Accepts RFC 3339, a naive `YYYY-MM-DD HH:MM:SS[.f]` (read as UTC), or an
/// integer epoch in seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    let epoch: i64 = raw.parse().ok()?;
    if epoch >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// First non-empty creation timestamp value among the known field names.
pub fn created_at_value(fields: &Fields) -> Option<&str> {
    std::iter::once(CREATED_AT_FIELD)
        .chain(CREATED_AT_ALIASES)
        .filter_map(|name| fields.get(name))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        let ts = parse_timestamp("2024-01-01T00:00:00.000Z").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_704_067_200_000);

        let offset = parse_timestamp("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(offset, ts);
    }

    #[test]
    fn test_parse_naive() {
        let ts = parse_timestamp("2024-01-01 00:00:01").unwrap();
        assert_eq!(ts.timestamp(), 1_704_067_201);
    }

    #[test]
    fn test_parse_epoch() {
        assert_eq!(
            parse_timestamp("1704067200000").unwrap().timestamp(),
            1_704_067_200
        );
        assert_eq!(
            parse_timestamp("1704067200").unwrap().timestamp(),
            1_704_067_200
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("   ").is_none());
    }

    #[test]
    fn test_created_at_value_aliases() {
        let mut fields = Fields::new();
        assert!(created_at_value(&fields).is_none());

        fields.insert("timestamp".to_string(), "1".to_string());
        assert_eq!(created_at_value(&fields), Some("1"));

        fields.insert("created_at".to_string(), "2".to_string());
        assert_eq!(created_at_value(&fields), Some("2"));

        fields.insert(CREATED_AT_FIELD.to_string(), String::new());
        assert_eq!(created_at_value(&fields), Some("2"));

        fields.insert(CREATED_AT_FIELD.to_string(), "3".to_string());
        assert_eq!(created_at_value(&fields), Some("3"));
    }
}
