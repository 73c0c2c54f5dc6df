//! Per-database content summary kept in the registry.

use super::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of runs of one database in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
}

impl RunCounts {
    pub(crate) fn add(&mut self, status: RunStatus, count: u64) {
        match status {
            RunStatus::Running => self.running += count,
            RunStatus::Completed => self.completed += count,
            RunStatus::Failed => self.failed += count,
            RunStatus::Aborted => self.aborted += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.running + self.completed + self.failed + self.aborted
    }
}

/// Last measured size and row count of a database file.
///
/// The file measurements are as of `measured_at` and may be stale while the
/// database is unreachable. `runs` is read from the ledger on every load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentStats {
    pub database_id: String,
    /// Location that was measured.
    pub path: PathBuf,
    pub row_count: u64,
    pub file_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub measured_at: DateTime<Utc>,
    pub runs: RunCounts,
}

impl ContentStats {
    /// True if the file at `path` looks unchanged since the last measurement.
    pub fn matches_file(
        &self,
        path: &std::path::Path,
        file_size: u64,
        modified_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.path == path && self.file_size == file_size && self.modified_at == modified_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    #[test]
    fn test_run_counts_by_status() {
        let mut counts = RunCounts::default();
        counts.add(RunStatus::Completed, 3);
        counts.add(RunStatus::Failed, 1);
        counts.add(RunStatus::Running, 1);

        assert_eq!(counts.completed, 3);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn test_matches_file_compares_path_size_and_mtime() {
        let mtime = Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).single();
        let stats = ContentStats {
            database_id: "tiktok".into(),
            path: PathBuf::from("/data/tiktok.sqlite"),
            row_count: 12,
            file_size: 4096,
            modified_at: mtime,
            measured_at: Utc::now(),
            runs: RunCounts::default(),
        };

        assert!(stats.matches_file(Path::new("/data/tiktok.sqlite"), 4096, mtime));
        assert!(!stats.matches_file(Path::new("/data/tiktok.sqlite"), 8192, mtime));
        assert!(!stats.matches_file(Path::new("/mnt/usb/tiktok.sqlite"), 4096, mtime));
    }
}
