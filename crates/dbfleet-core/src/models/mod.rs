//! Data models shared by the registry, the run ledger and the copy engine.

mod content;
mod database;
mod run;
mod stats;

pub use content::*;
pub use database::*;
pub use run::*;
pub use stats::*;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;

/// Timestamps are stored as UTC RFC 3339 text with millisecond precision, so
/// that lexical order matches chronological order and day/month/year buckets
/// are plain prefixes.
pub(crate) fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time at stored precision, with its stored text.
pub(crate) fn now_timestamp() -> (DateTime<Utc>, String) {
    let now = Utc::now().trunc_subsecs(3);
    let text = to_db_timestamp(&now);
    (now, text)
}

/// Parse a stored timestamp inside a row mapper.
pub(crate) fn parse_db_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_optional_timestamp(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_db_timestamp(idx, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_is_sortable_and_parses_back() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();

        let a = to_db_timestamp(&earlier);
        let b = to_db_timestamp(&later);

        assert_eq!(a, "2024-03-09T23:59:59.000Z");
        assert!(a < b);
        assert_eq!(parse_db_timestamp(0, &a).unwrap(), earlier);
    }

    #[test]
    fn test_now_round_trips_through_stored_text() {
        let (now, text) = now_timestamp();
        assert_eq!(parse_db_timestamp(0, &text).unwrap(), now);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_db_timestamp(3, "yesterday").is_err());
        assert!(parse_optional_timestamp(3, None).unwrap().is_none());
    }
}
