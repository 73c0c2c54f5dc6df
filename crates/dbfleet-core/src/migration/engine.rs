//! Batched, resumable copy of content between two managed databases.
//!
//! Source rows are read in row-key order. Each batch is filtered against the
//! content ids already in the target, inserted in one target transaction,
//! and only then recorded in the registry checkpoint. A copy interrupted at
//! any point resumes after the last committed batch and never inserts a
//! content id twice.

use super::checkpoint::{self, MigrationCheckpoint};
use crate::cancel::{CancellationToken, CancelledError};
use crate::config::MigrationConfig;
use crate::content::{ContentOpener, ContentStore, OpenMode};
use crate::error::{FleetError, Result};
use crate::ledger::RunLedger;
use crate::models::ContentRow;
use crate::registry::RegistryStore;
use crate::resolver::{Resolution, ResolvedPath};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a copy stopped before reaching the end of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    Cancelled,
    /// The source could not be read.
    SourceUnavailable,
    /// Writes kept failing and the target could not be re-resolved to the
    /// same location.
    TargetUnavailable,
    /// A collection run started on the source mid-copy.
    SourceBusy,
    /// A collection run started on the target mid-copy.
    TargetBusy,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InterruptReason::Cancelled => "cancelled",
            InterruptReason::SourceUnavailable => "source unavailable",
            InterruptReason::TargetUnavailable => "target unavailable",
            InterruptReason::SourceBusy => "source busy",
            InterruptReason::TargetBusy => "target busy",
        };
        f.write_str(text)
    }
}

impl From<CancelledError> for InterruptReason {
    fn from(_: CancelledError) -> Self {
        InterruptReason::Cancelled
    }
}

/// Per-call options of [`MigrationEngine::copy_metadata_content`].
#[derive(Clone, Default)]
pub struct CopyOptions {
    /// Ignore and replace any stored checkpoint instead of resuming from it.
    pub fresh: bool,
    /// Overrides the engine's batch size.
    pub batch_size: Option<usize>,
    pub cancel: Option<CancellationToken>,
    /// Called after each batch is committed and checkpointed.
    pub on_batch: Option<Arc<dyn Fn(&MigrationCheckpoint) + Send + Sync>>,
}

impl CopyOptions {
    pub fn fresh() -> Self {
        Self {
            fresh: true,
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_batch(mut self, callback: impl Fn(&MigrationCheckpoint) + Send + Sync + 'static) -> Self {
        self.on_batch = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("fresh", &self.fresh)
            .field("batch_size", &self.batch_size)
            .field("cancel", &self.cancel)
            .field("on_batch", &self.on_batch.is_some())
            .finish()
    }
}

/// Counts for one call of the copy; the checkpoint keeps the cumulative ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyReport {
    pub migration_id: Uuid,
    pub source_id: String,
    pub target_id: String,
    pub rows_copied: u64,
    /// Rows whose content id was already present in the target.
    pub rows_skipped: u64,
    pub rows_scanned: u64,
    pub batches: u64,
    /// Row key the copy resumed after, if it continued a checkpoint.
    pub resumed_from: Option<i64>,
}

/// What a copy would do, computed without writing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_id: String,
    pub target_id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    /// Source rows after the checkpoint, if any.
    pub pending_rows: u64,
    pub already_present: u64,
    pub to_copy: u64,
    pub resume_from: Option<i64>,
}

/// Copies content between registered databases.
pub struct MigrationEngine {
    store: Arc<RegistryStore>,
    ledger: RunLedger,
    opener: Arc<dyn ContentOpener>,
    batch_size: usize,
    resolve_attempts: u32,
    resolve_backoff: Duration,
}

impl MigrationEngine {
    pub fn new(store: Arc<RegistryStore>, opener: Arc<dyn ContentOpener>) -> Self {
        Self {
            ledger: RunLedger::new(store.clone()),
            store,
            opener,
            batch_size: MigrationConfig::DEFAULT_BATCH_SIZE,
            resolve_attempts: MigrationConfig::TARGET_RESOLVE_ATTEMPTS,
            resolve_backoff: MigrationConfig::TARGET_RESOLVE_BACKOFF,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// How often a failed batch write re-resolves the target, and the pause
    /// before each attempt.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.resolve_attempts = attempts;
        self.resolve_backoff = backoff;
        self
    }

    /// Copy every source row whose content id is not yet in the target.
    ///
    /// Resumes from a stored checkpoint unless `options.fresh` is set. Copied
    /// rows are tagged with the source id in their metadata. Fails with
    /// `SourceBusy`/`TargetBusy` if either side has a running collection run,
    /// and with `MigrationInterrupted` (carrying the checkpoint) if the copy
    /// stops part-way.
    pub fn copy_metadata_content(
        &self,
        source_id: &str,
        target_id: &str,
        options: &CopyOptions,
    ) -> Result<CopyReport> {
        let (source, target) = self.resolve_pair(source_id, target_id)?;
        if let Some(busy) = self.busy_error(source_id, target_id)? {
            return Err(busy);
        }

        let mut checkpoint = match checkpoint::load(&self.store, source_id, target_id)? {
            Some(existing) if !options.fresh => {
                info!(
                    "Resuming migration {} from {} to {} after row {:?}",
                    existing.migration_id, source_id, target_id, existing.last_row_key
                );
                existing
            }
            Some(stale) => {
                debug!("Discarding checkpoint of migration {}", stale.migration_id);
                checkpoint::discard(&self.store, source_id, target_id)?;
                MigrationCheckpoint::new(source_id, target_id)
            }
            None => MigrationCheckpoint::new(source_id, target_id),
        };
        let batch_size = options.batch_size.unwrap_or(self.batch_size).max(1);

        let mut report = CopyReport {
            migration_id: checkpoint.migration_id,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            rows_copied: 0,
            rows_skipped: 0,
            rows_scanned: 0,
            batches: 0,
            resumed_from: checkpoint.last_row_key,
        };

        let mut source_store = self.opener.open(&source.path, OpenMode::ReadOnly)?;
        let mut target_store = self.opener.open(&target.path, OpenMode::ReadWrite)?;
        info!(
            "Copying {} ({}) into {} ({}) in batches of {}",
            source_id,
            source.path.display(),
            target_id,
            target.path.display(),
            batch_size
        );

        loop {
            if let Err(cancelled) = options.cancel.as_ref().map_or(Ok(()), |t| t.check()) {
                return Err(interrupted(cancelled.into(), checkpoint));
            }
            if let Some(reason) = self.busy_reason(source_id, target_id)? {
                return Err(interrupted(reason, checkpoint));
            }

            let batch = match source_store.scan_after(checkpoint.last_row_key, batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Reading {} failed: {}", source_id, e);
                    return Err(interrupted(InterruptReason::SourceUnavailable, checkpoint));
                }
            };
            let Some(last_row_key) = batch.last().map(|row| row.row_key) else {
                break;
            };

            let Some(copied) = self.write_batch(&mut target_store, &target, source_id, &batch)
            else {
                return Err(interrupted(InterruptReason::TargetUnavailable, checkpoint));
            };

            checkpoint.advance(last_row_key, batch.len(), copied);
            checkpoint::save(&self.store, &checkpoint)?;

            let skipped = batch.len().saturating_sub(copied);
            report.batches += 1;
            report.rows_scanned += batch.len() as u64;
            report.rows_copied += copied as u64;
            report.rows_skipped += skipped as u64;
            debug!(
                "Batch {} of migration {}: {} copied, {} skipped, through row {}",
                report.batches, checkpoint.migration_id, copied, skipped, last_row_key
            );

            if let Some(callback) = &options.on_batch {
                callback(&checkpoint);
            }
        }

        checkpoint::discard(&self.store, source_id, target_id)?;
        info!(
            "Migration {} from {} to {} complete: {} copied, {} skipped",
            report.migration_id, source_id, target_id, report.rows_copied, report.rows_skipped
        );
        Ok(report)
    }

    /// Count what a copy would do without writing anything.
    pub fn plan(&self, source_id: &str, target_id: &str) -> Result<MigrationPlan> {
        let (source, target) = self.resolve_pair(source_id, target_id)?;
        let resume_from =
            checkpoint::load(&self.store, source_id, target_id)?.and_then(|c| c.last_row_key);

        let mut source_store = self.opener.open(&source.path, OpenMode::ReadOnly)?;
        let mut target_store = self.opener.open(&target.path, OpenMode::ReadOnly)?;

        let mut cursor = resume_from;
        let mut pending_rows = 0u64;
        let mut already_present = 0u64;
        loop {
            let batch = source_store.scan_after(cursor, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.row_key);

            let ids: Vec<&str> = batch.iter().map(|row| row.content_id.as_str()).collect();
            let existing = target_store.existing_ids(&ids)?;
            pending_rows += batch.len() as u64;
            already_present += batch
                .iter()
                .filter(|row| existing.contains(&row.content_id))
                .count() as u64;
        }

        Ok(MigrationPlan {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            source_path: source.path,
            target_path: target.path,
            pending_rows,
            already_present,
            to_copy: pending_rows - already_present,
            resume_from,
        })
    }

    /// The stored checkpoint of an interrupted copy, if any.
    pub fn checkpoint(&self, source_id: &str, target_id: &str) -> Result<Option<MigrationCheckpoint>> {
        checkpoint::load(&self.store, source_id, target_id)
    }

    /// Forget an interrupted copy so the next one starts from the beginning.
    pub fn discard_checkpoint(&self, source_id: &str, target_id: &str) -> Result<bool> {
        checkpoint::discard(&self.store, source_id, target_id)
    }

    fn resolve_pair(&self, source_id: &str, target_id: &str) -> Result<(ResolvedPath, ResolvedPath)> {
        if source_id == target_id {
            return Err(FleetError::Validation {
                field: "target_id".to_string(),
                message: "source and target must be different databases".to_string(),
            });
        }
        let source = self.store.resolve_required(source_id)?;
        let target = self.store.resolve_required(target_id)?;
        if source.path == target.path {
            return Err(FleetError::Validation {
                field: "target_id".to_string(),
                message: format!(
                    "{} and {} both resolve to {}",
                    source_id,
                    target_id,
                    source.path.display()
                ),
            });
        }
        Ok((source, target))
    }

    fn busy_reason(&self, source_id: &str, target_id: &str) -> Result<Option<InterruptReason>> {
        Ok(self.busy_error(source_id, target_id)?.map(|e| match e {
            FleetError::SourceBusy { .. } => InterruptReason::SourceBusy,
            _ => InterruptReason::TargetBusy,
        }))
    }

    fn busy_error(&self, source_id: &str, target_id: &str) -> Result<Option<FleetError>> {
        if let Some(run) = self.ledger.active_run(source_id)? {
            return Ok(Some(FleetError::SourceBusy {
                id: source_id.to_string(),
                run: run.id,
            }));
        }
        if let Some(run) = self.ledger.active_run(target_id)? {
            return Ok(Some(FleetError::TargetBusy {
                id: target_id.to_string(),
                run: run.id,
            }));
        }
        Ok(None)
    }

    /// Insert a batch, re-resolving the target between failed attempts.
    ///
    /// Returns `None` once attempts are exhausted or the target resolves to
    /// a different location than the copy started with.
    fn write_batch(
        &self,
        target_store: &mut Box<dyn ContentStore>,
        target: &ResolvedPath,
        source_id: &str,
        batch: &[ContentRow],
    ) -> Option<usize> {
        let mut attempt = 0;
        loop {
            let error = match insert_new_rows(target_store.as_mut(), source_id, batch) {
                Ok(copied) => return Some(copied),
                Err(e) => e,
            };
            attempt += 1;
            warn!(
                "Writing to {} failed (attempt {}/{}): {}",
                target.database_id,
                attempt,
                self.resolve_attempts + 1,
                error
            );
            if attempt > self.resolve_attempts {
                return None;
            }
            std::thread::sleep(self.resolve_backoff);

            match self.store.resolve(&target.database_id) {
                Ok(Resolution::Resolved(again)) if again.path == target.path => {
                    match self.opener.open(&again.path, OpenMode::ReadWrite) {
                        Ok(reopened) => *target_store = reopened,
                        Err(e) => warn!("Reopening {} failed: {}", again.path.display(), e),
                    }
                }
                Ok(Resolution::Resolved(elsewhere)) => {
                    warn!(
                        "{} now resolves to {} instead of {}",
                        target.database_id,
                        elsewhere.path.display(),
                        target.path.display()
                    );
                    return None;
                }
                Ok(Resolution::Unreachable { .. }) => {
                    debug!("{} still unreachable", target.database_id);
                }
                Err(e) => warn!("Re-resolving {} failed: {}", target.database_id, e),
            }
        }
    }
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("batch_size", &self.batch_size)
            .field("resolve_attempts", &self.resolve_attempts)
            .field("resolve_backoff", &self.resolve_backoff)
            .finish_non_exhaustive()
    }
}

/// Insert the rows of `batch` whose content id the target does not have yet.
fn insert_new_rows(
    target: &mut dyn ContentStore,
    source_id: &str,
    batch: &[ContentRow],
) -> Result<usize> {
    let ids: Vec<&str> = batch.iter().map(|row| row.content_id.as_str()).collect();
    let existing = target.existing_ids(&ids)?;

    let mut seen = HashSet::new();
    let fresh: Vec<ContentRow> = batch
        .iter()
        .filter(|row| !existing.contains(&row.content_id) && seen.insert(row.content_id.as_str()))
        .map(|row| {
            let mut row = row.clone();
            row.tag_origin(MigrationConfig::ORIGIN_METADATA_KEY, source_id);
            row
        })
        .collect();

    if fresh.is_empty() {
        return Ok(0);
    }
    target.insert_batch(&fresh)
}

fn interrupted(reason: InterruptReason, checkpoint: MigrationCheckpoint) -> FleetError {
    warn!(
        "Migration {} from {} to {} interrupted ({}) after row {:?}",
        checkpoint.migration_id,
        checkpoint.source_id,
        checkpoint.target_id,
        reason,
        checkpoint.last_row_key
    );
    FleetError::MigrationInterrupted {
        source_id: checkpoint.source_id.clone(),
        target_id: checkpoint.target_id.clone(),
        reason,
        checkpoint,
    }
}
