//! SQLite-backed registry store for managed databases and their locations.

use crate::config::RegistryConfig;
use crate::error::{FleetError, Result};
use crate::ledger;
use crate::models::{
    now_timestamp, parse_db_timestamp, parse_optional_timestamp, to_db_timestamp, AlternativePath,
    ContentStats, DatabaseLocations, DatabaseRecord, DatabaseStatus, RunState,
};
use crate::platform::normalize_db_path;
use crate::resolver::{PathResolver, PathSource, Resolution, ResolvedPath};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const RECORD_COLUMNS: &str = "id, kind, primary_path, status, created_at, last_verified_at";
const ALTERNATIVE_COLUMNS: &str = "database_id, path, priority, last_seen_available";

/// Everything known about one database at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub record: DatabaseRecord,
    pub resolution: Resolution,
    pub alternative_count: usize,
    /// Most recent run by sequence number, whatever its status.
    pub latest_run: Option<RunState>,
    /// Last content measurement, if the database was ever measured.
    pub content_stats: Option<ContentStats>,
}

impl StatusReport {
    /// The running run, if any. A running run is always the latest one.
    pub fn active_run(&self) -> Option<&RunState> {
        self.latest_run.as_ref().filter(|run| run.is_running())
    }
}

/// SQLite-backed registry of managed databases.
///
/// Uses WAL mode for safe concurrent access across processes and
/// `Arc<Mutex<Connection>>` for thread safety within a process. Path probes
/// run without the connection lock held.
pub struct RegistryStore {
    conn: Arc<Mutex<Connection>>,
    resolver: PathResolver,
    db_path: PathBuf,
}

impl RegistryStore {
    /// Open the registry at the default platform location.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open() -> Result<Self> {
        let db_path = crate::platform::registry_db_path()?;
        Self::open_at(&db_path)
    }

    /// Open the registry at a specific path with the default filesystem probe.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        Self::open_with_resolver(db_path, PathResolver::default())
    }

    /// Open the registry at a specific path, resolving locations with `resolver`.
    pub fn open_with_resolver(db_path: &Path, resolver: PathResolver) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| FleetError::Io {
                    message: format!(
                        "Failed to create registry directory: {}",
                        parent.display()
                    ),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        debug!("Opened registry at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            resolver,
            db_path: db_path.to_path_buf(),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};\n\
             PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA foreign_keys=ON;\n\
             PRAGMA temp_store=MEMORY;",
            RegistryConfig::BUSY_TIMEOUT_MS,
        ))?;

        // Renames and removals rely on cascading foreign keys.
        let enforced: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if enforced != 1 {
            return Err(FleetError::Config {
                message: "SQLite build does not enforce foreign keys".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS databases (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                primary_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'archived', 'missing')),
                created_at TEXT NOT NULL,
                last_verified_at TEXT
            );

            CREATE TABLE IF NOT EXISTS alternative_paths (
                id INTEGER PRIMARY KEY,
                database_id TEXT NOT NULL
                    REFERENCES databases(id) ON DELETE CASCADE ON UPDATE CASCADE,
                path TEXT NOT NULL,
                priority INTEGER NOT NULL,
                last_seen_available TEXT,
                UNIQUE (database_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_alternative_paths_database
                ON alternative_paths(database_id, priority);

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                database_id TEXT NOT NULL
                    REFERENCES databases(id) ON DELETE CASCADE ON UPDATE CASCADE,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('running', 'completed', 'failed', 'aborted')),
                started_at TEXT NOT NULL,
                ended_at TEXT,
                item_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                resolved_path TEXT NOT NULL,
                pid INTEGER NOT NULL,
                host TEXT NOT NULL,
                UNIQUE (database_id, seq),
                CHECK ((status = 'running') = (ended_at IS NULL))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_running
                ON runs(database_id) WHERE status = 'running';

            CREATE TABLE IF NOT EXISTS migration_checkpoints (
                source_id TEXT NOT NULL
                    REFERENCES databases(id) ON DELETE CASCADE ON UPDATE CASCADE,
                target_id TEXT NOT NULL
                    REFERENCES databases(id) ON DELETE CASCADE ON UPDATE CASCADE,
                migration_id TEXT NOT NULL,
                last_row_key INTEGER,
                rows_copied INTEGER NOT NULL DEFAULT 0,
                rows_skipped INTEGER NOT NULL DEFAULT 0,
                rows_scanned INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source_id, target_id)
            );

            CREATE TABLE IF NOT EXISTS content_stats (
                database_id TEXT PRIMARY KEY
                    REFERENCES databases(id) ON DELETE CASCADE ON UPDATE CASCADE,
                path TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                modified_at TEXT,
                measured_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS registry_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO registry_config (key, value) VALUES ('schema_version', ?1)",
            params![RegistryConfig::SCHEMA_VERSION.to_string()],
        )?;
        let stored: String = conn.query_row(
            "SELECT value FROM registry_config WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        match stored.parse::<u32>() {
            Ok(version) if version == RegistryConfig::SCHEMA_VERSION => Ok(()),
            // Older registries only lack tables created above.
            Ok(version) if version < RegistryConfig::SCHEMA_VERSION => {
                conn.execute(
                    "UPDATE registry_config SET value = ?1 WHERE key = 'schema_version'",
                    params![RegistryConfig::SCHEMA_VERSION.to_string()],
                )?;
                debug!(
                    "Upgraded registry schema from version {} to {}",
                    version,
                    RegistryConfig::SCHEMA_VERSION
                );
                Ok(())
            }
            _ => Err(FleetError::Config {
                message: format!(
                    "Registry schema version {} is newer than supported version {}",
                    stored,
                    RegistryConfig::SCHEMA_VERSION
                ),
            }),
        }
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| FleetError::StorageIntegrity {
            message: "Failed to acquire registry connection lock".to_string(),
            source: None,
        })
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` succeeds; any error rolls the whole change back.
    pub(crate) fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Location of the registry file itself.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    // ========================================
    // Database CRUD
    // ========================================

    /// Register a new database.
    pub fn add(&self, id: &str, kind: &str, primary_path: &Path) -> Result<DatabaseRecord> {
        validate_id(id)?;
        let primary = normalize_db_path(primary_path)?;
        let (created_at, created_text) = now_timestamp();

        self.write_tx(|tx| {
            if record_exists(tx, id)? {
                return Err(FleetError::DuplicateId { id: id.to_string() });
            }
            tx.execute(
                "INSERT INTO databases (id, kind, primary_path, status, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4)",
                params![id, kind, path_text(&primary), created_text],
            )?;
            Ok(())
        })?;

        info!("Registered database {} at {}", id, primary.display());

        Ok(DatabaseRecord {
            id: id.to_string(),
            kind: kind.to_string(),
            primary_path: primary,
            status: DatabaseStatus::Active,
            created_at,
            last_verified_at: None,
        })
    }

    /// Remove a database with its alternatives, run history and checkpoints.
    ///
    /// Refused while the database has a running run.
    pub fn remove(&self, id: &str) -> Result<()> {
        self.write_tx(|tx| {
            if !record_exists(tx, id)? {
                return Err(FleetError::not_found(id));
            }
            if let Some(run) = ledger::running_run_on(tx, id)? {
                return Err(FleetError::ActiveRun {
                    id: id.to_string(),
                    run: run.id,
                });
            }

            tx.execute(
                "DELETE FROM alternative_paths WHERE database_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM migration_checkpoints WHERE source_id = ?1 OR target_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM runs WHERE database_id = ?1", params![id])?;
            tx.execute("DELETE FROM databases WHERE id = ?1", params![id])?;
            Ok(())
        })?;

        info!("Removed database {}", id);
        Ok(())
    }

    /// Change a database's logical id. Alternatives, runs and checkpoints
    /// follow through cascading foreign keys.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<DatabaseRecord> {
        validate_id(new_id)?;

        let record = self.write_tx(|tx| {
            if !record_exists(tx, old_id)? {
                return Err(FleetError::not_found(old_id));
            }
            if old_id != new_id {
                if record_exists(tx, new_id)? {
                    return Err(FleetError::DuplicateId {
                        id: new_id.to_string(),
                    });
                }
                tx.execute(
                    "UPDATE databases SET id = ?2 WHERE id = ?1",
                    params![old_id, new_id],
                )?;
            }
            get_record(tx, new_id)
        })?;

        if old_id != new_id {
            info!("Renamed database {} to {}", old_id, new_id);
        }
        Ok(record)
    }

    /// Replace the primary path.
    ///
    /// The old primary becomes the lowest-priority alternative. If the new
    /// path was an alternative it is promoted and leaves the fallback list.
    /// Setting the current primary again changes nothing.
    pub fn set_path(&self, id: &str, new_primary: &Path) -> Result<DatabaseLocations> {
        let new_primary = normalize_db_path(new_primary)?;
        let new_text = path_text(&new_primary);

        let (locations, changed) = self.write_tx(|tx| {
            let record = get_record(tx, id)?;
            if record.primary_path == new_primary {
                return Ok((get_locations(tx, id)?, false));
            }

            tx.execute(
                "DELETE FROM alternative_paths WHERE database_id = ?1 AND path = ?2",
                params![id, new_text],
            )?;
            let next_priority: i64 = tx.query_row(
                "SELECT COALESCE(MAX(priority) + 1, 0) FROM alternative_paths WHERE database_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO alternative_paths
                    (database_id, path, priority, last_seen_available)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    path_text(&record.primary_path),
                    next_priority,
                    record.last_verified_at.as_ref().map(crate::models::to_db_timestamp),
                ],
            )?;
            tx.execute(
                "UPDATE databases SET primary_path = ?2, last_verified_at = NULL WHERE id = ?1",
                params![id, new_text],
            )?;

            Ok((get_locations(tx, id)?, true))
        })?;

        if changed {
            info!("Primary path of {} is now {}", id, new_primary.display());
        }
        Ok(locations)
    }

    /// Add a fallback location. Returns false if the path is already the
    /// primary or an alternative of this database.
    ///
    /// The path does not need to exist yet; it is probed on resolution.
    pub fn add_alternative_path(&self, id: &str, path: &Path, priority: i64) -> Result<bool> {
        let path = normalize_db_path(path)?;

        let added = self.write_tx(|tx| {
            let record = get_record(tx, id)?;
            if record.primary_path == path {
                return Ok(false);
            }
            let rows = tx.execute(
                "INSERT OR IGNORE INTO alternative_paths (database_id, path, priority)
                 VALUES (?1, ?2, ?3)",
                params![id, path_text(&path), priority],
            )?;
            Ok(rows > 0)
        })?;

        if added {
            debug!(
                "Added alternative path for {}: {} (priority {})",
                id,
                path.display(),
                priority
            );
        }
        Ok(added)
    }

    /// Remove a fallback location. Returns false if it was not registered.
    pub fn remove_alternative_path(&self, id: &str, path: &Path) -> Result<bool> {
        let path = normalize_db_path(path)?;

        let removed = self.write_tx(|tx| {
            if !record_exists(tx, id)? {
                return Err(FleetError::not_found(id));
            }
            let rows = tx.execute(
                "DELETE FROM alternative_paths WHERE database_id = ?1 AND path = ?2",
                params![id, path_text(&path)],
            )?;
            Ok(rows > 0)
        })?;

        if removed {
            debug!("Removed alternative path for {}: {}", id, path.display());
        }
        Ok(removed)
    }

    /// Set the lifecycle status, e.g. to archive a database.
    pub fn set_status(&self, id: &str, status: DatabaseStatus) -> Result<DatabaseRecord> {
        self.write_tx(|tx| {
            let rows = tx.execute(
                "UPDATE databases SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            if rows == 0 {
                return Err(FleetError::not_found(id));
            }
            get_record(tx, id)
        })
    }

    // ========================================
    // Queries
    // ========================================

    pub fn get(&self, id: &str) -> Result<DatabaseRecord> {
        let conn = self.lock_conn()?;
        get_record(&conn, id)
    }

    pub fn find(&self, id: &str) -> Result<Option<DatabaseRecord>> {
        let conn = self.lock_conn()?;
        find_record(&conn, id)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        record_exists(&conn, id)
    }

    /// The record with its alternatives in resolution order.
    pub fn locations(&self, id: &str) -> Result<DatabaseLocations> {
        let conn = self.lock_conn()?;
        get_locations(&conn, id)
    }

    /// All registered databases, ordered by id.
    pub fn list(&self) -> Result<Vec<DatabaseRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM databases ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn list_by_kind(&self, kind: &str) -> Result<Vec<DatabaseRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM databases WHERE kind = ?1 ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![kind], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ========================================
    // Resolution
    // ========================================

    /// Find the first reachable location of a database.
    ///
    /// Probes run with no registry lock held. A successful probe stamps the
    /// winning location's availability timestamp.
    pub fn resolve(&self, id: &str) -> Result<Resolution> {
        let locations = self.locations(id)?;
        let resolution = self.resolver.resolve(&locations);

        if let Resolution::Resolved(resolved) = &resolution {
            if let Err(e) = self.stamp_available(resolved) {
                warn!(
                    "Could not record availability of {} at {}: {}",
                    id,
                    resolved.path.display(),
                    e
                );
            }
        }
        Ok(resolution)
    }

    /// Resolve, failing with `DatabaseUnreachable` if nothing answers.
    pub fn resolve_required(&self, id: &str) -> Result<ResolvedPath> {
        self.resolve(id)?.require(id)
    }

    fn stamp_available(&self, resolved: &ResolvedPath) -> Result<()> {
        let (_, now) = now_timestamp();
        let conn = self.lock_conn()?;
        match resolved.source {
            PathSource::Primary => conn.execute(
                "UPDATE databases SET last_verified_at = ?2 WHERE id = ?1 AND primary_path = ?3",
                params![resolved.database_id, now, path_text(&resolved.path)],
            )?,
            PathSource::Alternative { .. } => conn.execute(
                "UPDATE alternative_paths SET last_seen_available = ?3
                 WHERE database_id = ?1 AND path = ?2",
                params![resolved.database_id, path_text(&resolved.path), now],
            )?,
        };
        Ok(())
    }

    /// Re-resolve a database and record the outcome in its status.
    ///
    /// Active and missing databases flip between the two; archived ones keep
    /// their status.
    pub fn refresh(&self, id: &str) -> Result<DatabaseRecord> {
        let resolution = self.resolve(id)?;
        let status = if resolution.is_reachable() {
            DatabaseStatus::Active
        } else {
            DatabaseStatus::Missing
        };

        self.write_tx(|tx| {
            tx.execute(
                "UPDATE databases SET status = ?2 WHERE id = ?1 AND status != 'archived'",
                params![id, status.as_str()],
            )?;
            get_record(tx, id)
        })
    }

    /// Re-resolve every registered database. Returns the refreshed records.
    pub fn refresh_all(&self) -> Result<Vec<DatabaseRecord>> {
        let ids: Vec<String> = self.list()?.into_iter().map(|record| record.id).collect();
        let mut refreshed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.refresh(&id) {
                Ok(record) => refreshed.push(record),
                // Removed by another process since listing.
                Err(FleetError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(refreshed)
    }

    /// Remove every database whose status is `missing`.
    ///
    /// With `dry_run` nothing is deleted; the ids that would go are returned.
    /// Databases with a running run are always kept.
    pub fn purge_missing(&self, dry_run: bool) -> Result<Vec<String>> {
        let missing: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|record| record.status == DatabaseStatus::Missing)
            .map(|record| record.id)
            .collect();

        let mut purged = Vec::new();
        for id in missing {
            if dry_run {
                let conn = self.lock_conn()?;
                if ledger::running_run_on(&conn, &id)?.is_none() {
                    purged.push(id);
                }
                continue;
            }
            match self.remove(&id) {
                Ok(()) => purged.push(id),
                Err(FleetError::ActiveRun { run, .. }) => {
                    warn!("Not purging {}: {} is still running", id, run);
                }
                Err(FleetError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !dry_run && !purged.is_empty() {
            info!("Purged {} missing database(s)", purged.len());
        }
        Ok(purged)
    }

    /// Record, resolution and latest run of a database.
    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let resolution = self.resolve(id)?;

        let conn = self.lock_conn()?;
        let locations = get_locations(&conn, id)?;
        let latest_run = ledger::latest_run_on(&conn, id)?;
        let content_stats = find_content_stats(&conn, id)?;

        Ok(StatusReport {
            record: locations.record,
            resolution,
            alternative_count: locations.alternatives.len(),
            latest_run,
            content_stats,
        })
    }

    /// Last stored content measurement of a database, with live run counts.
    pub fn content_stats(&self, id: &str) -> Result<Option<ContentStats>> {
        let conn = self.lock_conn()?;
        if !record_exists(&conn, id)? {
            return Err(FleetError::not_found(id));
        }
        find_content_stats(&conn, id)
    }

    /// Replace the stored content measurement of a database.
    pub(crate) fn save_content_stats(&self, stats: &ContentStats) -> Result<()> {
        let modified_at = stats.modified_at.as_ref().map(to_db_timestamp);
        let measured_at = to_db_timestamp(&stats.measured_at);
        self.write_tx(|tx| {
            if !record_exists(tx, &stats.database_id)? {
                return Err(FleetError::not_found(&stats.database_id));
            }
            tx.execute(
                "INSERT INTO content_stats
                    (database_id, path, row_count, file_size, modified_at, measured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (database_id) DO UPDATE SET
                    path = excluded.path,
                    row_count = excluded.row_count,
                    file_size = excluded.file_size,
                    modified_at = excluded.modified_at,
                    measured_at = excluded.measured_at",
                params![
                    stats.database_id,
                    path_text(&stats.path),
                    i64::try_from(stats.row_count).unwrap_or(i64::MAX),
                    i64::try_from(stats.file_size).unwrap_or(i64::MAX),
                    modified_at,
                    measured_at
                ],
            )?;
            Ok(())
        })?;
        debug!(
            "Measured {}: {} rows, {} bytes",
            stats.database_id, stats.row_count, stats.file_size
        );
        Ok(())
    }
}

impl std::fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

// ========================================
// Row helpers
// ========================================

fn validate_id(id: &str) -> Result<()> {
    let message = if id.is_empty() {
        "database id must not be empty"
    } else if id.trim() != id {
        "database id must not have leading or trailing whitespace"
    } else if id.chars().any(char::is_control) {
        "database id must not contain control characters"
    } else {
        return Ok(());
    };
    Err(FleetError::Validation {
        field: "id".to_string(),
        message: message.to_string(),
    })
}

pub(crate) fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<DatabaseRecord> {
    let status: String = row.get(3)?;
    let status = DatabaseStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown database status '{}'", status).into(),
        )
    })?;
    let created_at: String = row.get(4)?;

    Ok(DatabaseRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        primary_path: PathBuf::from(row.get::<_, String>(2)?),
        status,
        created_at: parse_db_timestamp(4, &created_at)?,
        last_verified_at: parse_optional_timestamp(5, row.get(5)?)?,
    })
}

fn map_alternative(row: &Row<'_>) -> rusqlite::Result<AlternativePath> {
    Ok(AlternativePath {
        database_id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        priority: row.get(2)?,
        last_seen_available: parse_optional_timestamp(3, row.get(3)?)?,
    })
}

fn find_content_stats(conn: &Connection, id: &str) -> Result<Option<ContentStats>> {
    let stats = conn
        .query_row(
            "SELECT database_id, path, row_count, file_size, modified_at, measured_at
             FROM content_stats WHERE database_id = ?1",
            params![id],
            |row| {
                let row_count: i64 = row.get(2)?;
                let file_size: i64 = row.get(3)?;
                let measured_at: String = row.get(5)?;
                Ok(ContentStats {
                    database_id: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    row_count: u64::try_from(row_count).unwrap_or(0),
                    file_size: u64::try_from(file_size).unwrap_or(0),
                    modified_at: parse_optional_timestamp(4, row.get(4)?)?,
                    measured_at: parse_db_timestamp(5, &measured_at)?,
                    runs: Default::default(),
                })
            },
        )
        .optional()?;

    match stats {
        Some(mut stats) => {
            stats.runs = ledger::run_counts_on(conn, id)?;
            Ok(Some(stats))
        }
        None => Ok(None),
    }
}

fn record_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM databases WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn find_record(conn: &Connection, id: &str) -> Result<Option<DatabaseRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM databases WHERE id = ?1", RECORD_COLUMNS),
            params![id],
            map_record,
        )
        .optional()?;
    Ok(record)
}

fn get_record(conn: &Connection, id: &str) -> Result<DatabaseRecord> {
    find_record(conn, id)?.ok_or_else(|| FleetError::not_found(id))
}

fn get_locations(conn: &Connection, id: &str) -> Result<DatabaseLocations> {
    let record = get_record(conn, id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM alternative_paths WHERE database_id = ?1 ORDER BY priority, id",
        ALTERNATIVE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![id], map_alternative)?;

    let mut alternatives = Vec::new();
    for row in rows {
        alternatives.push(row?);
    }

    Ok(DatabaseLocations {
        record,
        alternatives,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn create_test_registry() -> (RegistryStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test-registry.db");
        let registry = RegistryStore::open_at(&db_path).unwrap();
        (registry, temp_dir)
    }

    fn create_db_file(parent: &Path, name: &str) -> PathBuf {
        let path = parent.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn count_rows(registry: &RegistryStore, table: &str) -> i64 {
        let conn = registry.lock_conn().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_add_creates_active_record() {
        let (registry, temp_dir) = create_test_registry();
        let path = temp_dir.path().join("tiktok.sqlite");

        let record = registry.add("tiktok", "tiktok", &path).unwrap();

        assert_eq!(record.status, DatabaseStatus::Active);
        assert_eq!(record.primary_path, path);
        assert_eq!(registry.get("tiktok").unwrap(), record);
    }

    #[test]
    fn test_add_duplicate_id_fails() {
        let (registry, temp_dir) = create_test_registry();
        let path = temp_dir.path().join("a.sqlite");

        registry.add("tiktok", "tiktok", &path).unwrap();
        let err = registry.add("tiktok", "tiktok", &path).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DuplicateId);
    }

    #[test]
    fn test_add_rejects_relative_path_and_blank_id() {
        let (registry, _temp_dir) = create_test_registry();

        let err = registry
            .add("tiktok", "tiktok", Path::new("relative.sqlite"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);

        let err = registry
            .add(" ", "tiktok", Path::new("/data/x.sqlite"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_remove_deletes_alternatives() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("youtube", "youtube", &temp_dir.path().join("yt.sqlite"))
            .unwrap();
        registry
            .add_alternative_path("youtube", &temp_dir.path().join("backup.sqlite"), 0)
            .unwrap();

        registry.remove("youtube").unwrap();

        assert!(!registry.exists("youtube").unwrap());
        assert_eq!(count_rows(&registry, "alternative_paths"), 0);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let (registry, _temp_dir) = create_test_registry();
        let err = registry.remove("nope").unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));
    }

    #[test]
    fn test_rename_moves_alternatives() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("twitter", "twitter", &temp_dir.path().join("tw.sqlite"))
            .unwrap();
        registry
            .add_alternative_path("twitter", &temp_dir.path().join("tw-2.sqlite"), 0)
            .unwrap();

        let record = registry.rename("twitter", "x").unwrap();

        assert_eq!(record.id, "x");
        assert!(!registry.exists("twitter").unwrap());
        let locations = registry.locations("x").unwrap();
        assert_eq!(locations.alternatives.len(), 1);
        assert_eq!(locations.alternatives[0].database_id, "x");
    }

    #[test]
    fn test_rename_onto_existing_id_fails() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("a", "k", &temp_dir.path().join("a.sqlite"))
            .unwrap();
        registry
            .add("b", "k", &temp_dir.path().join("b.sqlite"))
            .unwrap();

        let err = registry.rename("a", "b").unwrap_err();

        assert!(matches!(err, FleetError::DuplicateId { ref id } if id == "b"));
        assert!(registry.exists("a").unwrap());
    }

    #[test]
    fn test_set_path_demotes_old_primary() {
        let (registry, temp_dir) = create_test_registry();
        let old = temp_dir.path().join("old.sqlite");
        let new = temp_dir.path().join("new.sqlite");
        registry.add("tiktok", "tiktok", &old).unwrap();
        registry
            .add_alternative_path("tiktok", &temp_dir.path().join("usb.sqlite"), 4)
            .unwrap();

        let locations = registry.set_path("tiktok", &new).unwrap();

        assert_eq!(locations.record.primary_path, new);
        let last = locations.alternatives.last().unwrap();
        assert_eq!(last.path, old);
        assert_eq!(last.priority, 5);
    }

    #[test]
    fn test_set_path_promotes_alternative() {
        let (registry, temp_dir) = create_test_registry();
        let old = temp_dir.path().join("old.sqlite");
        let alt = temp_dir.path().join("alt.sqlite");
        registry.add("tiktok", "tiktok", &old).unwrap();
        registry.add_alternative_path("tiktok", &alt, 0).unwrap();

        let locations = registry.set_path("tiktok", &alt).unwrap();

        assert_eq!(locations.record.primary_path, alt);
        assert_eq!(locations.alternatives.len(), 1);
        assert_eq!(locations.alternatives[0].path, old);
    }

    #[test]
    fn test_set_path_same_path_is_noop() {
        let (registry, temp_dir) = create_test_registry();
        let path = temp_dir.path().join("same.sqlite");
        registry.add("tiktok", "tiktok", &path).unwrap();

        let locations = registry.set_path("tiktok", &path).unwrap();

        assert_eq!(locations.record.primary_path, path);
        assert!(locations.alternatives.is_empty());
    }

    #[test]
    fn test_add_alternative_duplicate_returns_false() {
        let (registry, temp_dir) = create_test_registry();
        let primary = temp_dir.path().join("p.sqlite");
        let alt = temp_dir.path().join("a.sqlite");
        registry.add("db", "k", &primary).unwrap();

        assert!(registry.add_alternative_path("db", &alt, 1).unwrap());
        assert!(!registry.add_alternative_path("db", &alt, 2).unwrap());
        assert!(!registry.add_alternative_path("db", &primary, 0).unwrap());
        assert_eq!(registry.locations("db").unwrap().alternatives.len(), 1);
    }

    #[test]
    fn test_alternatives_ordered_by_priority_then_insertion() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("db", "k", &temp_dir.path().join("p.sqlite"))
            .unwrap();
        let late = temp_dir.path().join("late.sqlite");
        let first_tie = temp_dir.path().join("tie-1.sqlite");
        let second_tie = temp_dir.path().join("tie-2.sqlite");
        registry.add_alternative_path("db", &late, 9).unwrap();
        registry.add_alternative_path("db", &first_tie, 1).unwrap();
        registry.add_alternative_path("db", &second_tie, 1).unwrap();

        let order: Vec<PathBuf> = registry
            .locations("db")
            .unwrap()
            .alternatives
            .into_iter()
            .map(|alt| alt.path)
            .collect();

        assert_eq!(order, vec![first_tie, second_tie, late]);
    }

    #[test]
    fn test_remove_alternative_path() {
        let (registry, temp_dir) = create_test_registry();
        let alt = temp_dir.path().join("a.sqlite");
        registry
            .add("db", "k", &temp_dir.path().join("p.sqlite"))
            .unwrap();
        registry.add_alternative_path("db", &alt, 0).unwrap();

        assert!(registry.remove_alternative_path("db", &alt).unwrap());
        assert!(!registry.remove_alternative_path("db", &alt).unwrap());
        assert!(registry
            .remove_alternative_path("other", &alt)
            .unwrap_err()
            .kind()
            == ErrorKind::NotFound);
    }

    #[test]
    fn test_resolve_stamps_primary() {
        let (registry, temp_dir) = create_test_registry();
        let path = create_db_file(temp_dir.path(), "p.sqlite");
        registry.add("db", "k", &path).unwrap();

        let resolution = registry.resolve("db").unwrap();

        assert_eq!(resolution.path(), Some(path.as_path()));
        assert!(registry.get("db").unwrap().last_verified_at.is_some());
    }

    #[test]
    fn test_resolve_stamps_alternative() {
        let (registry, temp_dir) = create_test_registry();
        let alt = create_db_file(temp_dir.path(), "alt.sqlite");
        registry
            .add("db", "k", &temp_dir.path().join("gone.sqlite"))
            .unwrap();
        registry.add_alternative_path("db", &alt, 0).unwrap();

        let resolved = registry.resolve_required("db").unwrap();

        assert_eq!(resolved.path, alt);
        let locations = registry.locations("db").unwrap();
        assert!(locations.record.last_verified_at.is_none());
        assert!(locations.alternatives[0].last_seen_available.is_some());
    }

    #[test]
    fn test_resolve_required_unreachable() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("db", "k", &temp_dir.path().join("gone.sqlite"))
            .unwrap();

        let err = registry.resolve_required("db").unwrap_err();

        assert!(matches!(err, FleetError::DatabaseUnreachable { ref tried, .. } if tried.len() == 1));
    }

    #[test]
    fn test_refresh_marks_missing_and_back() {
        let (registry, temp_dir) = create_test_registry();
        let path = temp_dir.path().join("flaky.sqlite");
        registry.add("db", "k", &path).unwrap();

        assert_eq!(
            registry.refresh("db").unwrap().status,
            DatabaseStatus::Missing
        );

        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            registry.refresh("db").unwrap().status,
            DatabaseStatus::Active
        );
    }

    #[test]
    fn test_refresh_keeps_archived() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("db", "k", &temp_dir.path().join("gone.sqlite"))
            .unwrap();
        registry.set_status("db", DatabaseStatus::Archived).unwrap();

        assert_eq!(
            registry.refresh("db").unwrap().status,
            DatabaseStatus::Archived
        );
    }

    #[test]
    fn test_purge_missing_dry_run_keeps_records() {
        let (registry, temp_dir) = create_test_registry();
        let present = create_db_file(temp_dir.path(), "here.sqlite");
        registry.add("here", "k", &present).unwrap();
        registry
            .add("gone", "k", &temp_dir.path().join("gone.sqlite"))
            .unwrap();
        registry.refresh_all().unwrap();

        assert_eq!(registry.purge_missing(true).unwrap(), vec!["gone"]);
        assert!(registry.exists("gone").unwrap());

        assert_eq!(registry.purge_missing(false).unwrap(), vec!["gone"]);
        assert!(!registry.exists("gone").unwrap());
        assert!(registry.exists("here").unwrap());
    }

    #[test]
    fn test_list_by_kind() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .add("tt-1", "tiktok", &temp_dir.path().join("1.sqlite"))
            .unwrap();
        registry
            .add("yt-1", "youtube", &temp_dir.path().join("2.sqlite"))
            .unwrap();
        registry
            .add("tt-2", "tiktok", &temp_dir.path().join("3.sqlite"))
            .unwrap();

        let ids: Vec<String> = registry
            .list_by_kind("tiktok")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert_eq!(ids, vec!["tt-1", "tt-2"]);
        assert_eq!(registry.list().unwrap().len(), 3);
    }

    #[test]
    fn test_status_without_runs() {
        let (registry, temp_dir) = create_test_registry();
        let path = create_db_file(temp_dir.path(), "p.sqlite");
        registry.add("db", "k", &path).unwrap();

        let report = registry.status("db").unwrap();

        assert!(report.resolution.is_reachable());
        assert!(report.latest_run.is_none());
        assert!(report.active_run().is_none());
        assert_eq!(report.alternative_count, 0);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("registry.db");
        {
            let registry = RegistryStore::open_at(&db_path).unwrap();
            registry
                .add("db", "k", &temp_dir.path().join("p.sqlite"))
                .unwrap();
        }

        let reopened = RegistryStore::open_at(&db_path).unwrap();
        assert!(reopened.exists("db").unwrap());
    }

    #[test]
    fn test_newer_schema_version_is_rejected() {
        let (registry, temp_dir) = create_test_registry();
        registry
            .lock_conn()
            .unwrap()
            .execute(
                "UPDATE registry_config SET value = '99' WHERE key = 'schema_version'",
                [],
            )
            .unwrap();
        drop(registry);

        let err = RegistryStore::open_at(&temp_dir.path().join("test-registry.db")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_older_registry_is_upgraded() {
        let (registry, temp_dir) = create_test_registry();
        {
            let conn = registry.lock_conn().unwrap();
            conn.execute_batch(
                "DROP TABLE content_stats;
                 UPDATE registry_config SET value = '1' WHERE key = 'schema_version';",
            )
            .unwrap();
        }
        drop(registry);

        let registry = RegistryStore::open_at(&temp_dir.path().join("test-registry.db")).unwrap();
        let conn = registry.lock_conn().unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM registry_config WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, RegistryConfig::SCHEMA_VERSION.to_string());
        drop(conn);
        assert_eq!(count_rows(&registry, "content_stats"), 0);
    }

    #[test]
    fn test_content_stats_of_unknown_database() {
        let (registry, _temp_dir) = create_test_registry();
        assert_eq!(
            registry.content_stats("nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
