//! The minimal view of a content row the copy engine reasons about.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key holding non-object metadata once a copied row has been tagged.
pub const WRAPPED_METADATA_KEY: &str = "value";

/// A content row from a managed database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRow {
    /// Position in the source store's insertion order. Only meaningful
    /// within the store the row was read from.
    pub row_key: i64,
    /// Natural unique identifier of the content (the platform's post id).
    pub content_id: String,
    pub platform: String,
    /// Creation timestamp as stored by the collector.
    pub created_at: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl ContentRow {
    /// A row not yet stored anywhere; the store assigns the row key.
    pub fn new(
        content_id: impl Into<String>,
        platform: impl Into<String>,
        created_at: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            row_key: 0,
            content_id: content_id.into(),
            platform: platform.into(),
            created_at: created_at.into(),
            payload,
            metadata: serde_json::Value::Null,
        }
    }

    /// Record which logical database this row was copied from.
    ///
    /// Object metadata gains the origin key. Any other non-null metadata is
    /// kept under [`WRAPPED_METADATA_KEY`] next to it.
    pub fn tag_origin(&mut self, key: &str, origin: &str) {
        if !self.metadata.is_object() {
            let mut map = serde_json::Map::new();
            match self.metadata.take() {
                serde_json::Value::Null => {}
                previous => {
                    map.insert(WRAPPED_METADATA_KEY.to_string(), previous);
                }
            }
            self.metadata = serde_json::Value::Object(map);
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), serde_json::Value::String(origin.to_string()));
        }
    }
}

/// Bucket size for period counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Day,
    Month,
    Year,
}

impl TimeWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Day => "day",
            TimeWindow::Month => "month",
            TimeWindow::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "day" => Some(TimeWindow::Day),
            "month" => Some(TimeWindow::Month),
            "year" => Some(TimeWindow::Year),
            _ => None,
        }
    }

    /// Length of the ISO-8601 prefix identifying a bucket
    /// (`YYYY-MM-DD`, `YYYY-MM`, `YYYY`).
    pub fn prefix_len(&self) -> usize {
        match self {
            TimeWindow::Day => 10,
            TimeWindow::Month => 7,
            TimeWindow::Year => 4,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of items in one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCount {
    pub period: String,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(metadata: serde_json::Value) -> ContentRow {
        ContentRow {
            row_key: 1,
            content_id: "p1".into(),
            platform: "twitter".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            payload: json!({"rawContent": "hello"}),
            metadata,
        }
    }

    #[test]
    fn test_tag_origin_keeps_existing_metadata() {
        let mut r = row(json!({"labels": ["a"]}));
        r.tag_origin("orig_db", "tiktok_alt");
        assert_eq!(r.metadata, json!({"labels": ["a"], "orig_db": "tiktok_alt"}));
    }

    #[test]
    fn test_tag_origin_replaces_null_metadata() {
        let mut r = row(serde_json::Value::Null);
        r.tag_origin("orig_db", "tiktok_alt");
        assert_eq!(r.metadata, json!({"orig_db": "tiktok_alt"}));
    }

    #[test]
    fn test_tag_origin_wraps_non_object_metadata() {
        let mut r = row(json!(["label-a", "label-b"]));
        r.tag_origin("orig_db", "src");
        assert_eq!(
            r.metadata,
            json!({"value": ["label-a", "label-b"], "orig_db": "src"})
        );

        let mut r = row(json!("note"));
        r.tag_origin("orig_db", "src");
        assert_eq!(r.metadata, json!({"value": "note", "orig_db": "src"}));
    }

    #[test]
    fn test_time_window_prefixes() {
        assert_eq!(TimeWindow::parse("Month"), Some(TimeWindow::Month));
        assert_eq!(&"2024-05-17T10:00:00Z"[..TimeWindow::Day.prefix_len()], "2024-05-17");
        assert_eq!(&"2024-05-17T10:00:00Z"[..TimeWindow::Year.prefix_len()], "2024");
        assert_eq!(TimeWindow::parse("week"), None);
    }
}
