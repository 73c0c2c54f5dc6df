//! Registry methods for DatabaseFleet.

use crate::error::{ErrorKind, Result};
use crate::models::{ContentStats, DatabaseLocations, DatabaseRecord, DatabaseStatus};
use crate::registry::StatusReport;
use crate::resolver::{Resolution, ResolvedPath};
use crate::DatabaseFleet;
use std::path::Path;
use tracing::warn;

impl DatabaseFleet {
    /// Register a new database at `primary_path`.
    pub fn add(&self, id: &str, kind: &str, primary_path: &Path) -> Result<DatabaseRecord> {
        self.registry.add(id, kind, primary_path)
    }

    /// Remove a database and everything recorded about it.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.registry.remove(id)
    }

    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<DatabaseRecord> {
        self.registry.rename(old_id, new_id)
    }

    /// Point a database at a new primary location.
    pub fn set_path(&self, id: &str, new_primary: &Path) -> Result<DatabaseLocations> {
        self.registry.set_path(id, new_primary)
    }

    pub fn add_alternative_path(&self, id: &str, path: &Path, priority: i64) -> Result<bool> {
        self.registry.add_alternative_path(id, path, priority)
    }

    pub fn remove_alternative_path(&self, id: &str, path: &Path) -> Result<bool> {
        self.registry.remove_alternative_path(id, path)
    }

    pub fn get(&self, id: &str) -> Result<DatabaseRecord> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Result<Vec<DatabaseRecord>> {
        self.registry.list()
    }

    pub fn list_by_kind(&self, kind: &str) -> Result<Vec<DatabaseRecord>> {
        self.registry.list_by_kind(kind)
    }

    pub fn set_status(&self, id: &str, status: DatabaseStatus) -> Result<DatabaseRecord> {
        self.registry.set_status(id, status)
    }

    pub fn resolve(&self, id: &str) -> Result<Resolution> {
        self.registry.resolve(id)
    }

    pub fn resolve_required(&self, id: &str) -> Result<ResolvedPath> {
        self.registry.resolve_required(id)
    }

    /// Re-resolve every database and re-measure the reachable ones.
    pub fn refresh_all(&self) -> Result<Vec<DatabaseRecord>> {
        let records = self.registry.refresh_all()?;
        for record in records.iter().filter(|r| r.status == DatabaseStatus::Active) {
            if let Err(e) = self.reader.refresh_stats(&record.id) {
                warn!("Could not measure {}: {}", record.id, e);
            }
        }
        Ok(records)
    }

    pub fn purge_missing(&self, dry_run: bool) -> Result<Vec<String>> {
        self.registry.purge_missing(dry_run)
    }

    /// Record, resolution, latest run and content measurement of a database.
    ///
    /// A reachable database is re-measured first; a failed measurement is
    /// logged and the previous one reported.
    pub fn status(&self, id: &str) -> Result<StatusReport> {
        if let Err(e) = self.reader.refresh_stats(id) {
            if e.kind() == ErrorKind::NotFound {
                return Err(e);
            }
            warn!("Could not measure {}: {}", id, e);
        }
        self.registry.status(id)
    }

    /// Stored content measurement, without touching the database file.
    pub fn content_stats(&self, id: &str) -> Result<Option<ContentStats>> {
        self.registry.content_stats(id)
    }
}
