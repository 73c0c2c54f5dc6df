//! Persisted progress of a copy between two databases.
//!
//! A checkpoint names the last source row key whose batch is committed in
//! the target. It is written to the registry after each committed batch and
//! deleted when the copy completes.

use crate::error::Result;
use crate::models::{now_timestamp, parse_db_timestamp, to_db_timestamp};
use crate::registry::RegistryStore;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resumable state of one source→target copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    /// Identifies one logical copy across its resumptions.
    pub migration_id: Uuid,
    pub source_id: String,
    pub target_id: String,
    /// Row key of the last source row covered by a committed batch.
    pub last_row_key: Option<i64>,
    /// Cumulative over every resumption of this copy.
    pub rows_copied: u64,
    pub rows_skipped: u64,
    pub rows_scanned: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationCheckpoint {
    pub fn new(source_id: &str, target_id: &str) -> Self {
        let (now, _) = now_timestamp();
        Self {
            migration_id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            last_row_key: None,
            rows_copied: 0,
            rows_skipped: 0,
            rows_scanned: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Fold one committed batch into the checkpoint.
    pub(crate) fn advance(&mut self, last_row_key: i64, scanned: usize, copied: usize) {
        self.last_row_key = Some(last_row_key);
        self.rows_scanned += scanned as u64;
        self.rows_copied += copied as u64;
        self.rows_skipped += scanned.saturating_sub(copied) as u64;
        self.updated_at = now_timestamp().0;
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn map_checkpoint(row: &Row<'_>) -> rusqlite::Result<MigrationCheckpoint> {
    let migration_id: String = row.get(0)?;
    let migration_id = Uuid::parse_str(&migration_id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let started_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(MigrationCheckpoint {
        migration_id,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        last_row_key: row.get(3)?,
        rows_copied: from_i64(row.get(4)?),
        rows_skipped: from_i64(row.get(5)?),
        rows_scanned: from_i64(row.get(6)?),
        started_at: parse_db_timestamp(7, &started_at)?,
        updated_at: parse_db_timestamp(8, &updated_at)?,
    })
}

pub(crate) fn load(
    store: &RegistryStore,
    source_id: &str,
    target_id: &str,
) -> Result<Option<MigrationCheckpoint>> {
    let conn = store.lock_conn()?;
    let checkpoint = conn
        .query_row(
            "SELECT migration_id, source_id, target_id, last_row_key, rows_copied,
                    rows_skipped, rows_scanned, started_at, updated_at
             FROM migration_checkpoints WHERE source_id = ?1 AND target_id = ?2",
            params![source_id, target_id],
            map_checkpoint,
        )
        .optional()?;
    Ok(checkpoint)
}

pub(crate) fn save(store: &RegistryStore, checkpoint: &MigrationCheckpoint) -> Result<()> {
    store.write_tx(|tx| {
        tx.execute(
            "INSERT INTO migration_checkpoints
                (source_id, target_id, migration_id, last_row_key, rows_copied,
                 rows_skipped, rows_scanned, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(source_id, target_id) DO UPDATE SET
                 migration_id = excluded.migration_id,
                 last_row_key = excluded.last_row_key,
                 rows_copied = excluded.rows_copied,
                 rows_skipped = excluded.rows_skipped,
                 rows_scanned = excluded.rows_scanned,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at",
            params![
                checkpoint.source_id,
                checkpoint.target_id,
                checkpoint.migration_id.to_string(),
                checkpoint.last_row_key,
                to_i64(checkpoint.rows_copied),
                to_i64(checkpoint.rows_skipped),
                to_i64(checkpoint.rows_scanned),
                to_db_timestamp(&checkpoint.started_at),
                to_db_timestamp(&checkpoint.updated_at),
            ],
        )?;
        Ok(())
    })
}

pub(crate) fn discard(store: &RegistryStore, source_id: &str, target_id: &str) -> Result<bool> {
    let conn = store.lock_conn()?;
    let rows = conn.execute(
        "DELETE FROM migration_checkpoints WHERE source_id = ?1 AND target_id = ?2",
        params![source_id, target_id],
    )?;
    Ok(rows > 0)
}
