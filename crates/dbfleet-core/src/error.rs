//! Error types for the database fleet.
//!
//! Every public operation returns [`FleetError`]: one variant per failure
//! class, each carrying the ids, paths or checkpoint needed to resume or
//! diagnose. Storage-engine errors never cross the API unwrapped.

use crate::migration::{InterruptReason, MigrationCheckpoint};
use crate::models::{RunId, RunStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for registry, ledger and migration operations.
#[derive(Debug, Error)]
pub enum FleetError {
    // Registry errors
    #[error("Database not found: {id}")]
    NotFound { id: String },

    #[error("Database id already registered: {id}")]
    DuplicateId { id: String },

    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Database {id} is unreachable (tried {} location(s))", tried.len())]
    DatabaseUnreachable { id: String, tried: Vec<PathBuf> },

    // Run-state errors
    #[error("Database {id} has an active run ({run})")]
    ActiveRun { id: String, run: RunId },

    #[error("A run is already active for database {id} ({run})")]
    RunAlreadyActive { id: String, run: RunId },

    #[error("Run {run} is not running (status: {status})")]
    NotRunning { run: RunId, status: RunStatus },

    #[error("Run not found: {run}")]
    RunNotFound { run: RunId },

    // Migration errors
    #[error("Source database {id} is busy with {run}")]
    SourceBusy { id: String, run: RunId },

    #[error("Target database {id} is busy with {run}")]
    TargetBusy { id: String, run: RunId },

    #[error(
        "Migration {source_id} -> {target_id} interrupted ({reason}) after {} row(s) copied",
        checkpoint.rows_copied
    )]
    MigrationInterrupted {
        source_id: String,
        target_id: String,
        reason: InterruptReason,
        checkpoint: MigrationCheckpoint,
    },

    // Storage errors
    #[error("Registry storage error: {message}")]
    StorageIntegrity {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Content database error at {path:?}: {message}")]
    Content {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Coarse failure class, for callers that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicateId,
    InvalidPath,
    DatabaseUnreachable,
    ActiveRun,
    RunAlreadyActive,
    NotRunning,
    SourceBusy,
    TargetBusy,
    MigrationInterrupted,
    StorageIntegrity,
    Content,
    Io,
    Json,
    Config,
    Validation,
}

// Conversion implementations for common error types

impl From<rusqlite::Error> for FleetError {
    fn from(err: rusqlite::Error) -> Self {
        FleetError::StorageIntegrity {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl FleetError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FleetError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FleetError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn content(path: &std::path::Path, err: rusqlite::Error) -> Self {
        FleetError::Content {
            path: path.to_path_buf(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        FleetError::NotFound { id: id.into() }
    }

    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound { .. } | FleetError::RunNotFound { .. } => ErrorKind::NotFound,
            FleetError::DuplicateId { .. } => ErrorKind::DuplicateId,
            FleetError::InvalidPath { .. } => ErrorKind::InvalidPath,
            FleetError::DatabaseUnreachable { .. } => ErrorKind::DatabaseUnreachable,
            FleetError::ActiveRun { .. } => ErrorKind::ActiveRun,
            FleetError::RunAlreadyActive { .. } => ErrorKind::RunAlreadyActive,
            FleetError::NotRunning { .. } => ErrorKind::NotRunning,
            FleetError::SourceBusy { .. } => ErrorKind::SourceBusy,
            FleetError::TargetBusy { .. } => ErrorKind::TargetBusy,
            FleetError::MigrationInterrupted { .. } => ErrorKind::MigrationInterrupted,
            FleetError::StorageIntegrity { .. } => ErrorKind::StorageIntegrity,
            FleetError::Content { .. } => ErrorKind::Content,
            FleetError::Io { .. } => ErrorKind::Io,
            FleetError::Json { .. } => ErrorKind::Json,
            FleetError::Config { .. } => ErrorKind::Config,
            FleetError::Validation { .. } => ErrorKind::Validation,
        }
    }

    /// Check if the operation may succeed when attempted again later.
    ///
    /// Storage integrity failures are fatal and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::DatabaseUnreachable { .. } | FleetError::MigrationInterrupted { .. }
        )
    }

    /// Check if this error is a conflict with a collection run.
    pub fn is_run_conflict(&self) -> bool {
        matches!(
            self,
            FleetError::ActiveRun { .. }
                | FleetError::RunAlreadyActive { .. }
                | FleetError::NotRunning { .. }
                | FleetError::SourceBusy { .. }
                | FleetError::TargetBusy { .. }
        )
    }

    /// The resumable checkpoint, if this is an interrupted migration.
    pub fn checkpoint(&self) -> Option<&MigrationCheckpoint> {
        match self {
            FleetError::MigrationInterrupted { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::NotFound {
            id: "tiktok".into(),
        };
        assert_eq!(err.to_string(), "Database not found: tiktok");

        let err = FleetError::RunAlreadyActive {
            id: "youtube".into(),
            run: RunId(7),
        };
        assert_eq!(
            err.to_string(),
            "A run is already active for database youtube (run#7)"
        );
    }

    #[test]
    fn test_unreachable_display_counts_locations() {
        let err = FleetError::DatabaseUnreachable {
            id: "twitter".into(),
            tried: vec![PathBuf::from("/a.sqlite"), PathBuf::from("/b.sqlite")],
        };
        assert_eq!(
            err.to_string(),
            "Database twitter is unreachable (tried 2 location(s))"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            FleetError::RunNotFound { run: RunId(1) }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            FleetError::from(rusqlite::Error::InvalidQuery).kind(),
            ErrorKind::StorageIntegrity
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FleetError::DatabaseUnreachable {
            id: "x".into(),
            tried: vec![]
        }
        .is_retryable());
        assert!(!FleetError::from(rusqlite::Error::InvalidQuery).is_retryable());
        assert!(!FleetError::DuplicateId { id: "x".into() }.is_retryable());
    }

    #[test]
    fn test_run_conflicts() {
        assert!(FleetError::ActiveRun {
            id: "x".into(),
            run: RunId(1)
        }
        .is_run_conflict());
        assert!(!FleetError::NotFound { id: "x".into() }.is_run_conflict());
    }
}
