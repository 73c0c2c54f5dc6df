//! Read-only comparison views over the fleet.
//!
//! Content counts are bucketed by creation date (what was posted when);
//! collection counts are bucketed by the day a run ended (what was collected
//! when). Nothing here writes to a managed database; content measurements
//! are stored in the registry only.

use crate::content::{ContentOpener, OpenMode};
use crate::error::{FleetError, Result};
use crate::ledger::RunLedger;
use crate::models::{now_timestamp, ContentStats, PeriodCount, RunState, TimeWindow};
use crate::registry::RegistryStore;
use crate::resolver::Resolution;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Closed runs of one database that ended on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedDay {
    /// `YYYY-MM-DD`, UTC.
    pub day: String,
    pub runs: u64,
    pub items: u64,
    pub failed: u64,
}

/// Counts of two databases side by side for one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub period: String,
    pub left: u64,
    pub right: u64,
}

/// Read side of the fleet: per-period counts and run history.
pub struct ContentReader {
    store: Arc<RegistryStore>,
    ledger: RunLedger,
    opener: Arc<dyn ContentOpener>,
}

impl ContentReader {
    pub fn new(store: Arc<RegistryStore>, opener: Arc<dyn ContentOpener>) -> Self {
        Self {
            ledger: RunLedger::new(store.clone()),
            store,
            opener,
        }
    }

    /// Number of content rows per creation period, oldest first.
    ///
    /// `start` and `end` are inclusive days; `None` leaves that side open.
    pub fn posts_per_period(
        &self,
        database_id: &str,
        window: TimeWindow,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PeriodCount>> {
        let resolved = self.store.resolve_required(database_id)?;
        let mut content = self.opener.open(&resolved.path, OpenMode::ReadOnly)?;
        content.created_per_period(window, start, end)
    }

    pub fn row_count(&self, database_id: &str) -> Result<u64> {
        let resolved = self.store.resolve_required(database_id)?;
        let mut content = self.opener.open(&resolved.path, OpenMode::ReadOnly)?;
        content.row_count()
    }

    /// Closed runs per end day, from the ledger alone. Works while the
    /// database itself is unreachable.
    pub fn collected_per_day(&self, database_id: &str) -> Result<Vec<CollectedDay>> {
        self.store.get(database_id)?;

        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT substr(ended_at, 1, 10) AS day,
                    COUNT(*),
                    COALESCE(SUM(item_count), 0),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
             FROM runs
             WHERE database_id = ?1 AND status != 'running'
             GROUP BY day
             ORDER BY day",
        )?;
        let rows = stmt.query_map(params![database_id], |row| {
            let runs: i64 = row.get(1)?;
            let items: i64 = row.get(2)?;
            let failed: i64 = row.get(3)?;
            Ok(CollectedDay {
                day: row.get(0)?,
                runs: u64::try_from(runs).unwrap_or(0),
                items: u64::try_from(items).unwrap_or(0),
                failed: u64::try_from(failed).unwrap_or(0),
            })
        })?;

        let mut days = Vec::new();
        for row in rows {
            days.push(row?);
        }
        Ok(days)
    }

    /// Per-period counts of two databases over the union of their periods.
    pub fn compare(
        &self,
        left_id: &str,
        right_id: &str,
        window: TimeWindow,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PeriodComparison>> {
        let left = self.posts_per_period(left_id, window, start, end)?;
        let right = self.posts_per_period(right_id, window, start, end)?;

        let mut merged: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for count in left {
            merged.entry(count.period).or_default().0 = count.count;
        }
        for count in right {
            merged.entry(count.period).or_default().1 = count.count;
        }

        Ok(merged
            .into_iter()
            .map(|(period, (left, right))| PeriodComparison {
                period,
                left,
                right,
            })
            .collect())
    }

    /// Measure a database's file and row count and store the result.
    ///
    /// The rows are only recounted when the resolved file changed size,
    /// modification time or location since the last measurement. An
    /// unreachable database keeps its previous measurement, which is
    /// returned as is.
    pub fn refresh_stats(&self, database_id: &str) -> Result<Option<ContentStats>> {
        let resolved = match self.store.resolve(database_id)? {
            Resolution::Resolved(resolved) => resolved,
            Resolution::Unreachable { .. } => {
                debug!("{} unreachable, keeping its last measurement", database_id);
                return self.store.content_stats(database_id);
            }
        };

        let meta = std::fs::metadata(&resolved.path)
            .map_err(|e| FleetError::io_with_path(e, &resolved.path))?;
        let file_size = meta.len();
        let modified_at = meta
            .modified()
            .ok()
            .map(|mtime| DateTime::<Utc>::from(mtime).trunc_subsecs(3));

        let previous = self.store.content_stats(database_id)?;
        let row_count = match &previous {
            Some(stats) if stats.matches_file(&resolved.path, file_size, modified_at) => {
                stats.row_count
            }
            _ => {
                let mut content = self.opener.open(&resolved.path, OpenMode::ReadOnly)?;
                content.row_count()?
            }
        };

        self.store.save_content_stats(&ContentStats {
            database_id: database_id.to_string(),
            path: resolved.path,
            row_count,
            file_size,
            modified_at,
            measured_at: now_timestamp().0,
            runs: Default::default(),
        })?;
        self.store.content_stats(database_id)
    }

    /// Most recent runs, newest first.
    pub fn recent(&self, database_id: &str, limit: Option<usize>) -> Result<Vec<RunState>> {
        self.ledger.recent(database_id, limit)
    }
}

impl std::fmt::Debug for ContentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentStore, SqliteContentOpener, SqliteContentStore};
    use crate::error::ErrorKind;
    use crate::models::{ContentRow, RunStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_reader() -> (ContentReader, Arc<RegistryStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RegistryStore::open_at(&temp_dir.path().join("registry.db")).unwrap());
        let reader = ContentReader::new(store.clone(), Arc::new(SqliteContentOpener));
        (reader, store, temp_dir)
    }

    fn add_db(store: &RegistryStore, dir: &TempDir, id: &str, dates: &[&str]) {
        let path = dir.path().join(format!("{}.sqlite", id));
        let mut content = SqliteContentStore::create(&path).unwrap();
        let rows: Vec<ContentRow> = dates
            .iter()
            .enumerate()
            .map(|(i, date)| ContentRow::new(format!("{}-{}", id, i), id, *date, json!({})))
            .collect();
        content.insert_batch(&rows).unwrap();
        store.add(id, id, &path).unwrap();
    }

    #[test]
    fn test_posts_per_period_by_month() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &["2024-01-02", "2024-01-20", "2024-03-01"]);

        let counts = reader
            .posts_per_period("tiktok", TimeWindow::Month, None, None)
            .unwrap();

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].period, "2024-01");
        assert_eq!(counts[0].count, 2);
        assert_eq!(reader.row_count("tiktok").unwrap(), 3);
    }

    #[test]
    fn test_compare_fills_missing_periods_with_zero() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &["2023-05-01", "2024-05-01"]);
        add_db(&store, &temp_dir, "youtube", &["2024-06-01", "2024-07-01"]);

        let rows = reader
            .compare("tiktok", "youtube", TimeWindow::Year, None, None)
            .unwrap();

        assert_eq!(
            rows,
            vec![
                PeriodComparison {
                    period: "2023".into(),
                    left: 1,
                    right: 0
                },
                PeriodComparison {
                    period: "2024".into(),
                    left: 1,
                    right: 2
                },
            ]
        );
    }

    #[test]
    fn test_collected_per_day_from_ledger() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &[]);
        let ledger = RunLedger::new(store.clone());

        let ok = ledger.start_run("tiktok").unwrap();
        ledger.end_run(ok.id, RunStatus::Completed, 40, None).unwrap();
        let bad = ledger.start_run("tiktok").unwrap();
        ledger
            .end_run(bad.id, RunStatus::Failed, 2, Some("timeout"))
            .unwrap();
        ledger.start_run("tiktok").unwrap();

        let days = reader.collected_per_day("tiktok").unwrap();

        assert_eq!(days.len(), 1);
        assert_eq!(days[0].runs, 2);
        assert_eq!(days[0].items, 42);
        assert_eq!(days[0].failed, 1);
        assert_eq!(reader.recent("tiktok", None).unwrap().len(), 3);
    }

    /// Opener that counts how often a store is opened.
    struct CountingOpener {
        opens: std::sync::atomic::AtomicUsize,
    }

    impl ContentOpener for CountingOpener {
        fn open(&self, path: &std::path::Path, mode: OpenMode) -> Result<Box<dyn ContentStore>> {
            self.opens.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            SqliteContentOpener.open(path, mode)
        }
    }

    #[test]
    fn test_refresh_stats_measures_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RegistryStore::open_at(&temp_dir.path().join("registry.db")).unwrap());
        let opener = Arc::new(CountingOpener {
            opens: std::sync::atomic::AtomicUsize::new(0),
        });
        let reader = ContentReader::new(store.clone(), opener.clone());
        add_db(&store, &temp_dir, "tiktok", &["2024-01-02", "2024-01-03"]);
        let ledger = RunLedger::new(store.clone());
        let run = ledger.start_run("tiktok").unwrap();
        ledger.end_run(run.id, RunStatus::Completed, 2, None).unwrap();

        let stats = reader.refresh_stats("tiktok").unwrap().unwrap();

        assert_eq!(stats.row_count, 2);
        assert!(stats.file_size > 0);
        assert_eq!(stats.path, temp_dir.path().join("tiktok.sqlite"));
        assert_eq!(stats.runs.completed, 1);
        assert_eq!(store.content_stats("tiktok").unwrap(), Some(stats.clone()));
        assert_eq!(store.status("tiktok").unwrap().content_stats, Some(stats));

        // Unchanged file: the stored count is reused.
        reader.refresh_stats("tiktok").unwrap();
        assert_eq!(opener.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_stats_recounts_after_file_changes() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &["2024-01-02"]);
        assert_eq!(reader.refresh_stats("tiktok").unwrap().unwrap().row_count, 1);

        let path = temp_dir.path().join("tiktok.sqlite");
        let rows: Vec<ContentRow> = (0..200)
            .map(|i| ContentRow::new(format!("extra-{}", i), "tiktok", "2024-01-05", json!({})))
            .collect();
        SqliteContentStore::open(&path, OpenMode::ReadWrite)
            .unwrap()
            .insert_batch(&rows)
            .unwrap();

        assert_eq!(reader.refresh_stats("tiktok").unwrap().unwrap().row_count, 201);
    }

    #[test]
    fn test_refresh_stats_keeps_last_measurement_when_unreachable() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &["2024-01-02"]);
        let measured = reader.refresh_stats("tiktok").unwrap().unwrap();

        std::fs::remove_file(temp_dir.path().join("tiktok.sqlite")).unwrap();

        assert_eq!(reader.refresh_stats("tiktok").unwrap(), Some(measured));
    }

    #[test]
    fn test_stats_follow_rename_and_removal() {
        let (reader, store, temp_dir) = create_test_reader();
        add_db(&store, &temp_dir, "tiktok", &["2024-01-02"]);
        reader.refresh_stats("tiktok").unwrap();

        store.rename("tiktok", "tiktok-2024").unwrap();
        assert!(store.content_stats("tiktok-2024").unwrap().is_some());

        store.remove("tiktok-2024").unwrap();
        let conn = store.lock_conn().unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM content_stats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_unknown_database() {
        let (reader, _store, _temp_dir) = create_test_reader();
        assert_eq!(
            reader.collected_per_day("nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
