//! Registry records for managed databases and their candidate locations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle status of a managed database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Active,
    Archived,
    /// No candidate location was reachable at the last refresh.
    Missing,
}

impl DatabaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseStatus::Active => "active",
            DatabaseStatus::Archived => "archived",
            DatabaseStatus::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DatabaseStatus::Active),
            "archived" => Some(DatabaseStatus::Archived),
            "missing" => Some(DatabaseStatus::Missing),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A managed database as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// Stable logical id, independent of the physical location.
    pub id: String,
    /// Free-form category tag, usually the collected platform.
    pub kind: String,
    pub primary_path: PathBuf,
    pub status: DatabaseStatus,
    pub created_at: DateTime<Utc>,
    /// Last time the primary path answered a probe.
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// A fallback location for a managed database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativePath {
    pub database_id: String,
    pub path: PathBuf,
    /// Lower is tried first.
    pub priority: i64,
    pub last_seen_available: Option<DateTime<Utc>>,
}

/// A record together with its ordered fallback list: the input of resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseLocations {
    pub record: DatabaseRecord,
    /// Sorted by ascending priority, ties in insertion order.
    pub alternatives: Vec<AlternativePath>,
}

impl DatabaseLocations {
    /// All candidate paths in the order resolution tries them.
    pub fn candidates(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.record.primary_path.as_path())
            .chain(self.alternatives.iter().map(|alt| alt.path.as_path()))
    }

    /// Check whether `path` is already the primary or an alternative.
    pub fn contains(&self, path: &Path) -> bool {
        self.candidates().any(|candidate| candidate == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(primary: &str) -> DatabaseRecord {
        DatabaseRecord {
            id: "tiktok".into(),
            kind: "tiktok".into(),
            primary_path: PathBuf::from(primary),
            status: DatabaseStatus::Active,
            created_at: Utc::now(),
            last_verified_at: None,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DatabaseStatus::Active,
            DatabaseStatus::Archived,
            DatabaseStatus::Missing,
        ] {
            assert_eq!(DatabaseStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DatabaseStatus::parse("deleted"), None);
    }

    #[test]
    fn test_candidates_primary_first() {
        let locations = DatabaseLocations {
            record: record("/data/tiktok.sqlite"),
            alternatives: vec![AlternativePath {
                database_id: "tiktok".into(),
                path: PathBuf::from("/media/usb/tiktok.sqlite"),
                priority: 0,
                last_seen_available: None,
            }],
        };

        let candidates: Vec<&Path> = locations.candidates().collect();
        assert_eq!(
            candidates,
            vec![
                Path::new("/data/tiktok.sqlite"),
                Path::new("/media/usb/tiktok.sqlite")
            ]
        );
        assert!(locations.contains(Path::new("/media/usb/tiktok.sqlite")));
        assert!(!locations.contains(Path::new("/elsewhere.sqlite")));
    }
}
