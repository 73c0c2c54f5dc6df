//! SQLite content store for collector databases.
//!
//! Collector databases keep one `post` table: an integer row key, the
//! platform's unique post id, the creation date as ISO-8601 text and the
//! content and metadata as JSON text.

use super::{ContentOpener, ContentStore, OpenMode};
use crate::config::RegistryConfig;
use crate::error::{FleetError, Result};
use crate::models::{ContentRow, PeriodCount, TimeWindow};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Maximum number of ids bound into a single `IN (...)` lookup.
const ID_LOOKUP_CHUNK: usize = 500;

const POST_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS post (
    id INTEGER PRIMARY KEY,
    platform TEXT NOT NULL,
    platform_id TEXT NOT NULL UNIQUE,
    date_created TEXT NOT NULL,
    content TEXT,
    metadata_content TEXT
);
CREATE INDEX IF NOT EXISTS idx_post_date_created ON post(date_created);";

/// Content table of one collector database.
pub struct SqliteContentStore {
    conn: Connection,
    path: PathBuf,
    /// A read-only file without a `post` table behaves as empty.
    has_table: bool,
}

impl SqliteContentStore {
    /// Open an existing database file.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let flags = match mode {
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            OpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
            }
        };
        let conn =
            Connection::open_with_flags(path, flags).map_err(|e| FleetError::content(path, e))?;
        Self::from_connection(conn, path, mode)
    }

    /// Create (or open) a database file with an empty content table.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FleetError::io_with_path(e, parent))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| FleetError::content(path, e))?;
        Self::from_connection(conn, path, OpenMode::ReadWrite)
    }

    fn from_connection(conn: Connection, path: &Path, mode: OpenMode) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(RegistryConfig::BUSY_TIMEOUT_MS))
            .map_err(|e| FleetError::content(path, e))?;

        if mode == OpenMode::ReadWrite {
            conn.execute_batch(POST_SCHEMA)
                .map_err(|e| FleetError::content(path, e))?;
        }

        let has_table = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'post'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| FleetError::content(path, e))?
            .is_some();

        debug!(
            "Opened content store {} ({:?}, table present: {})",
            path.display(),
            mode,
            has_table
        );

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            has_table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) if !text.is_empty() => serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        _ => Ok(serde_json::Value::Null),
    }
}

fn json_text(value: &serde_json::Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(value)?))
}

fn map_post(row: &Row<'_>) -> rusqlite::Result<ContentRow> {
    Ok(ContentRow {
        row_key: row.get(0)?,
        content_id: row.get(1)?,
        platform: row.get(2)?,
        created_at: row.get(3)?,
        payload: json_column(row, 4)?,
        metadata: json_column(row, 5)?,
    })
}

impl ContentStore for SqliteContentStore {
    fn scan_after(&mut self, after: Option<i64>, limit: usize) -> Result<Vec<ContentRow>> {
        if !self.has_table || limit == 0 {
            return Ok(Vec::new());
        }
        let path = &self.path;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, platform_id, platform, date_created, content, metadata_content
                 FROM post WHERE id > ?1 ORDER BY id LIMIT ?2",
            )
            .map_err(|e| FleetError::content(path, e))?;
        let rows = stmt
            .query_map(params![after.unwrap_or(i64::MIN), limit], map_post)
            .map_err(|e| FleetError::content(path, e))?;

        let mut batch = Vec::new();
        for row in rows {
            batch.push(row.map_err(|e| FleetError::content(path, e))?);
        }
        Ok(batch)
    }

    fn existing_ids(&mut self, content_ids: &[&str]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        if !self.has_table {
            return Ok(found);
        }
        let path = &self.path;

        for chunk in content_ids.chunks(ID_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT platform_id FROM post WHERE platform_id IN ({})",
                    placeholders
                ))
                .map_err(|e| FleetError::content(path, e))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))
                .map_err(|e| FleetError::content(path, e))?;
            for row in rows {
                found.insert(row.map_err(|e| FleetError::content(path, e))?);
            }
        }
        Ok(found)
    }

    fn insert_batch(&mut self, rows: &[ContentRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let encoded = rows
            .iter()
            .map(|row| Ok((row, json_text(&row.payload)?, json_text(&row.metadata)?)))
            .collect::<Result<Vec<_>>>()?;

        let path = &self.path;
        let tx = self
            .conn
            .transaction()
            .map_err(|e| FleetError::content(path, e))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO post
                        (platform, platform_id, date_created, content, metadata_content)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(|e| FleetError::content(path, e))?;
            for (row, payload, metadata) in &encoded {
                inserted += stmt
                    .execute(params![
                        row.platform,
                        row.content_id,
                        row.created_at,
                        payload,
                        metadata
                    ])
                    .map_err(|e| FleetError::content(path, e))?;
            }
        }
        tx.commit().map_err(|e| FleetError::content(path, e))?;
        Ok(inserted)
    }

    fn row_count(&mut self) -> Result<u64> {
        if !self.has_table {
            return Ok(0);
        }
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM post", [], |row| row.get(0))
            .map_err(|e| FleetError::content(&self.path, e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn created_per_period(
        &mut self,
        window: TimeWindow,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PeriodCount>> {
        if !self.has_table {
            return Ok(Vec::new());
        }
        let path = &self.path;
        let day = |date: NaiveDate| date.format("%Y-%m-%d").to_string();

        let mut stmt = self
            .conn
            .prepare(
                "SELECT substr(date_created, 1, ?1) AS period, COUNT(*)
                 FROM post
                 WHERE (?2 IS NULL OR substr(date_created, 1, 10) >= ?2)
                   AND (?3 IS NULL OR substr(date_created, 1, 10) <= ?3)
                 GROUP BY period
                 ORDER BY period",
            )
            .map_err(|e| FleetError::content(path, e))?;
        let rows = stmt
            .query_map(
                params![window.prefix_len() as i64, start.map(day), end.map(day)],
                |row| {
                    let count: i64 = row.get(1)?;
                    Ok(PeriodCount {
                        period: row.get(0)?,
                        count: u64::try_from(count).unwrap_or(0),
                    })
                },
            )
            .map_err(|e| FleetError::content(path, e))?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.map_err(|e| FleetError::content(path, e))?);
        }
        Ok(counts)
    }
}

/// Opens collector databases with [`SqliteContentStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteContentOpener;

impl ContentOpener for SqliteContentOpener {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ContentStore>> {
        Ok(Box::new(SqliteContentStore::open(path, mode)?))
    }
}
