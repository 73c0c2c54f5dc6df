//! dbfleet core - registry, run ledger and copy engine for a fleet of
//! content-collection databases.
//!
//! Each managed database has a stable logical id, a primary location and an
//! ordered list of fallback locations (backup drives, mirrors). Collectors
//! start and end runs through the ledger; at most one run per database is
//! ever running. Content can be copied between databases in resumable,
//! deduplicating batches. All of this state lives in one SQLite registry
//! shared safely by every process on the host.
//!
//! # Example
//!
//! ```rust,no_run
//! use dbfleet_core::{DatabaseFleet, RunStatus};
//! use std::path::Path;
//!
//! fn main() -> dbfleet_core::Result<()> {
//!     let fleet = DatabaseFleet::open()?;
//!
//!     fleet.add("tiktok", "tiktok", Path::new("/data/tiktok.sqlite"))?;
//!     fleet.add_alternative_path("tiktok", Path::new("/mnt/usb/tiktok.sqlite"), 0)?;
//!
//!     let run = fleet.start_run("tiktok")?;
//!     // ... collect into run.resolved_path ...
//!     fleet.end_run(run.id, RunStatus::Completed, 1_250, None)?;
//!
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod cancel;
pub mod config;
pub mod content;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod models;
pub mod platform;
pub mod registry;
pub mod resolver;

mod api;

// Re-export commonly used types
pub use analytics::{CollectedDay, ContentReader, PeriodComparison};
pub use cancel::{CancellationToken, CancelledError};
pub use content::{ContentOpener, ContentStore, OpenMode, SqliteContentOpener, SqliteContentStore};
pub use error::{ErrorKind, FleetError, Result};
pub use ledger::RunLedger;
pub use migration::{
    CopyOptions, CopyReport, InterruptReason, MigrationCheckpoint, MigrationEngine, MigrationPlan,
};
pub use models::{
    AlternativePath, ContentRow, ContentStats, DatabaseLocations, DatabaseRecord, DatabaseStatus,
    PeriodCount, RunCounts, RunId, RunState, RunStatus, TimeWindow,
};
pub use registry::{RegistryStore, StatusReport};
pub use resolver::{FsProbe, PathProbe, PathResolver, PathSource, Resolution, ResolvedPath};

// Re-export builder from api module
pub use api::FleetBuilder;

use std::path::Path;
use std::sync::Arc;

/// Handle on the fleet: registry, run ledger, copy engine and reader over
/// one shared registry connection.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct DatabaseFleet {
    registry: Arc<RegistryStore>,
    ledger: RunLedger,
    migrations: MigrationEngine,
    reader: ContentReader,
}

impl DatabaseFleet {
    /// Open the fleet at the default registry location with default settings.
    pub fn open() -> Result<Self> {
        FleetBuilder::new().build()
    }

    /// Open the fleet with the registry at `registry_path`.
    pub fn open_at(registry_path: &Path) -> Result<Self> {
        FleetBuilder::new().registry_path(registry_path).build()
    }

    pub fn builder() -> FleetBuilder {
        FleetBuilder::new()
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn migrations(&self) -> &MigrationEngine {
        &self.migrations
    }

    pub fn reader(&self) -> &ContentReader {
        &self.reader
    }
}
