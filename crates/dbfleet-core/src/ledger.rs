//! Run-state ledger: one row per collection run, at most one running run per
//! database.
//!
//! The single-running-run rule is enforced by a partial unique index on
//! `runs(database_id) WHERE status = 'running'`, so two processes racing to
//! start a run cannot both win even across connections. Runs record the
//! owning pid and host; [`RunLedger::reap_orphaned_runs`] aborts runs whose
//! process on this host has died.

use crate::config::LedgerConfig;
use crate::error::{FleetError, Result};
use crate::models::{
    now_timestamp, parse_db_timestamp, parse_optional_timestamp, RunCounts, RunId, RunState,
    RunStatus,
};
use crate::platform::{current_host, is_process_alive};
use crate::registry::store::path_text;
use crate::registry::RegistryStore;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RUN_COLUMNS: &str =
    "id, database_id, seq, status, started_at, ended_at, item_count, error, resolved_path, pid, host";

/// Start and end collection runs against registered databases.
#[derive(Clone, Debug)]
pub struct RunLedger {
    store: Arc<RegistryStore>,
}

impl RunLedger {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    /// Begin a run on a database.
    ///
    /// The database is resolved first and the run records the location it
    /// bound to. Fails with `RunAlreadyActive` if another run is in progress,
    /// `DatabaseUnreachable` if no location answers.
    pub fn start_run(&self, database_id: &str) -> Result<RunState> {
        let resolved = self.store.resolve_required(database_id)?;
        let (_, started_at) = now_timestamp();
        let pid = std::process::id();
        let host = current_host();

        let run_id = self.store.write_tx(|tx| {
            let known: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM databases WHERE id = ?1",
                    params![database_id],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(FleetError::not_found(database_id));
            }

            let inserted = tx.execute(
                "INSERT INTO runs
                    (database_id, seq, status, started_at, item_count, resolved_path, pid, host)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, 'running', ?2, 0, ?3, ?4, ?5
                 FROM runs WHERE database_id = ?1",
                params![
                    database_id,
                    started_at,
                    path_text(&resolved.path),
                    pid,
                    host
                ],
            );

            match inserted {
                Ok(_) => Ok(RunId(tx.last_insert_rowid())),
                Err(e) if is_constraint_violation(&e) => match running_run_on(tx, database_id)? {
                    Some(active) => Err(FleetError::RunAlreadyActive {
                        id: database_id.to_string(),
                        run: active.id,
                    }),
                    None => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            }
        })?;

        let run = self.get_run(run_id)?;
        info!(
            "Started {} (seq {}) on {} at {}",
            run.id,
            run.seq,
            database_id,
            resolved.path.display()
        );
        Ok(run)
    }

    /// Close a running run with a terminal status.
    ///
    /// Fails with `NotRunning` if the run was already closed; the stored
    /// outcome is never overwritten.
    pub fn end_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        item_count: u64,
        error: Option<&str>,
    ) -> Result<RunState> {
        if !status.is_terminal() {
            return Err(FleetError::Validation {
                field: "status".to_string(),
                message: "a run can only be closed with a terminal status".to_string(),
            });
        }
        let item_count = i64::try_from(item_count).map_err(|_| FleetError::Validation {
            field: "item_count".to_string(),
            message: format!("{} does not fit the ledger", item_count),
        })?;
        let error = error.map(truncate_error);
        let (_, ended_at) = now_timestamp();

        let run = self.store.write_tx(|tx| {
            let current = run_on(tx, run_id)?.ok_or(FleetError::RunNotFound { run: run_id })?;
            if current.status != RunStatus::Running {
                return Err(FleetError::NotRunning {
                    run: run_id,
                    status: current.status,
                });
            }

            tx.execute(
                "UPDATE runs SET status = ?2, ended_at = ?3, item_count = ?4, error = ?5
                 WHERE id = ?1 AND status = 'running'",
                params![run_id.0, status.as_str(), ended_at, item_count, error],
            )?;
            run_on(tx, run_id)?.ok_or(FleetError::RunNotFound { run: run_id })
        })?;

        info!(
            "Ended {} on {} as {} ({} items)",
            run.id, run.database_id, run.status, run.item_count
        );
        Ok(run)
    }

    /// Close a running run as `aborted`.
    pub fn abort_run(&self, run_id: RunId, reason: &str) -> Result<RunState> {
        let current = self.get_run(run_id)?;
        self.end_run(run_id, RunStatus::Aborted, current.item_count, Some(reason))
    }

    pub fn get_run(&self, run_id: RunId) -> Result<RunState> {
        let conn = self.store.lock_conn()?;
        run_on(&conn, run_id)?.ok_or(FleetError::RunNotFound { run: run_id })
    }

    /// The running run of a database, if any.
    pub fn active_run(&self, database_id: &str) -> Result<Option<RunState>> {
        let conn = self.store.lock_conn()?;
        ensure_database(&conn, database_id)?;
        running_run_on(&conn, database_id)
    }

    /// Most recent runs of a database, newest first.
    pub fn recent(&self, database_id: &str, limit: Option<usize>) -> Result<Vec<RunState>> {
        let limit = limit.unwrap_or(LedgerConfig::RECENT_RUNS_DEFAULT_LIMIT);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.store.lock_conn()?;
        ensure_database(&conn, database_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE database_id = ?1 ORDER BY seq DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![database_id, limit], map_run)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Abort running runs whose owning process on this host is gone.
    ///
    /// Runs owned by other hosts are left alone. Returns the aborted runs.
    pub fn reap_orphaned_runs(&self) -> Result<Vec<RunState>> {
        let host = current_host();
        let running: Vec<RunState> = {
            let conn = self.store.lock_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE status = 'running' AND host = ?1",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map(params![host], map_run)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row?);
            }
            runs
        };

        let mut reaped = Vec::new();
        for run in running {
            if is_process_alive(run.pid) {
                continue;
            }
            let reason = format!("owning process {} on {} is gone", run.pid, run.host);
            match self.end_run(run.id, RunStatus::Aborted, run.item_count, Some(&reason)) {
                Ok(aborted) => {
                    warn!("Reaped orphaned {} on {}", aborted.id, aborted.database_id);
                    reaped.push(aborted);
                }
                // Closed by its owner between the scan and the update.
                Err(FleetError::NotRunning { .. }) => {
                    debug!("{} closed before it could be reaped", run.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }
}

fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(LedgerConfig::ERROR_SUMMARY_MAX_CHARS) {
        Some((cut, _)) => error[..cut].to_string(),
        None => error.to_string(),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn ensure_database(conn: &Connection, database_id: &str) -> Result<()> {
    let known: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM databases WHERE id = ?1",
            params![database_id],
            |row| row.get(0),
        )
        .optional()?;
    known
        .map(|_| ())
        .ok_or_else(|| FleetError::not_found(database_id))
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<RunState> {
    let status: String = row.get(3)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown run status '{}'", status).into(),
        )
    })?;
    let started_at: String = row.get(4)?;
    let item_count: i64 = row.get(6)?;

    Ok(RunState {
        id: RunId(row.get(0)?),
        database_id: row.get(1)?,
        seq: row.get(2)?,
        status,
        started_at: parse_db_timestamp(4, &started_at)?,
        ended_at: parse_optional_timestamp(5, row.get(5)?)?,
        item_count: u64::try_from(item_count).unwrap_or(0),
        error: row.get(7)?,
        resolved_path: PathBuf::from(row.get::<_, String>(8)?),
        pid: row.get(9)?,
        host: row.get(10)?,
    })
}

pub(crate) fn run_on(conn: &Connection, run_id: RunId) -> Result<Option<RunState>> {
    let run = conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![run_id.0],
            map_run,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn running_run_on(conn: &Connection, database_id: &str) -> Result<Option<RunState>> {
    let run = conn
        .query_row(
            &format!(
                "SELECT {} FROM runs WHERE database_id = ?1 AND status = 'running'",
                RUN_COLUMNS
            ),
            params![database_id],
            map_run,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn latest_run_on(conn: &Connection, database_id: &str) -> Result<Option<RunState>> {
    let run = conn
        .query_row(
            &format!(
                "SELECT {} FROM runs WHERE database_id = ?1 ORDER BY seq DESC LIMIT 1",
                RUN_COLUMNS
            ),
            params![database_id],
            map_run,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn run_counts_on(conn: &Connection, database_id: &str) -> Result<RunCounts> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM runs WHERE database_id = ?1 GROUP BY status")?;
    let rows = stmt.query_map(params![database_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = RunCounts::default();
    for row in rows {
        let (status, count) = row?;
        if let Some(status) = RunStatus::parse(&status) {
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
    }
    Ok(counts)
}
