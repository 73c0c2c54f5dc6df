//! Builder for configuring DatabaseFleet initialization.

use crate::config::{MigrationConfig, ResolverConfig};
use crate::content::{ContentOpener, SqliteContentOpener};
use crate::error::Result;
use crate::resolver::{FsProbe, PathProbe, PathResolver};
use crate::{ContentReader, DatabaseFleet, MigrationEngine, RegistryStore, RunLedger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builder for configuring DatabaseFleet initialization.
///
/// # Example
///
/// ```rust,no_run
/// use dbfleet_core::DatabaseFleet;
/// use std::time::Duration;
///
/// # fn main() -> dbfleet_core::Result<()> {
/// let fleet = DatabaseFleet::builder()
///     .registry_path("/srv/collect/registry.db")
///     .probe_timeout(Duration::from_millis(500))
///     .batch_size(1_000)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FleetBuilder {
    registry_path: Option<PathBuf>,
    probe_timeout: Duration,
    probe: Option<Arc<dyn PathProbe>>,
    opener: Option<Arc<dyn ContentOpener>>,
    batch_size: usize,
    resolve_attempts: u32,
    resolve_backoff: Duration,
    reap_orphans: bool,
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self {
            registry_path: None,
            probe_timeout: ResolverConfig::PROBE_TIMEOUT,
            probe: None,
            opener: None,
            batch_size: MigrationConfig::DEFAULT_BATCH_SIZE,
            resolve_attempts: MigrationConfig::TARGET_RESOLVE_ATTEMPTS,
            resolve_backoff: MigrationConfig::TARGET_RESOLVE_BACKOFF,
            reap_orphans: true,
        }
    }

    /// Use this registry file instead of the platform default.
    ///
    /// Default: `$DBFLEET_REGISTRY`, else the platform config directory.
    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    /// Upper bound on a single filesystem probe.
    ///
    /// Ignored when a custom probe is set.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replace the filesystem probe used for path resolution.
    pub fn probe(mut self, probe: Arc<dyn PathProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replace how content stores are opened.
    ///
    /// Default: [`SqliteContentOpener`]
    pub fn content_opener(mut self, opener: Arc<dyn ContentOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Default number of rows per copy batch.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Retries of a failed batch write, each preceded by `backoff` and a
    /// fresh resolution of the target.
    pub fn target_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.resolve_attempts = attempts;
        self.resolve_backoff = backoff;
        self
    }

    /// Abort runs left `running` by dead processes on this host when opening.
    ///
    /// Default: `true`
    pub fn reap_orphans(mut self, enable: bool) -> Self {
        self.reap_orphans = enable;
        self
    }

    pub fn build(self) -> Result<DatabaseFleet> {
        let registry_path = match self.registry_path {
            Some(path) => path,
            None => crate::platform::registry_db_path()?,
        };
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(FsProbe::new(self.probe_timeout)));
        let opener = self
            .opener
            .unwrap_or_else(|| Arc::new(SqliteContentOpener));

        let registry = Arc::new(RegistryStore::open_with_resolver(
            &registry_path,
            PathResolver::new(probe),
        )?);
        let ledger = RunLedger::new(registry.clone());

        if self.reap_orphans {
            match ledger.reap_orphaned_runs() {
                Ok(reaped) if !reaped.is_empty() => {
                    info!("Aborted {} orphaned run(s) on open", reaped.len());
                }
                Ok(_) => {}
                Err(e) => warn!("Could not reap orphaned runs: {}", e),
            }
        }

        let migrations = MigrationEngine::new(registry.clone(), opener.clone())
            .with_batch_size(self.batch_size)
            .with_retry(self.resolve_attempts, self.resolve_backoff);
        let reader = ContentReader::new(registry.clone(), opener);

        Ok(DatabaseFleet {
            registry,
            ledger,
            migrations,
            reader,
        })
    }
}

impl Default for FleetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    struct AlwaysReachable;

    impl PathProbe for AlwaysReachable {
        fn probe(&self, _path: &Path) -> bool {
            true
        }
    }

    #[test]
    fn test_build_at_custom_path() {
        let temp_dir = TempDir::new().unwrap();
        let registry_path = temp_dir.path().join("fleet").join("registry.db");

        let fleet = FleetBuilder::new()
            .registry_path(&registry_path)
            .build()
            .unwrap();

        assert_eq!(fleet.registry().path(), registry_path.as_path());
        assert!(registry_path.exists());
    }

    #[test]
    fn test_custom_probe_is_used() {
        let temp_dir = TempDir::new().unwrap();
        let fleet = FleetBuilder::new()
            .registry_path(temp_dir.path().join("registry.db"))
            .probe(Arc::new(AlwaysReachable))
            .build()
            .unwrap();
        fleet
            .add("remote", "tiktok", Path::new("/mnt/offline/tiktok.sqlite"))
            .unwrap();

        assert!(fleet.status("remote").unwrap().resolution.is_reachable());
    }

    #[test]
    fn test_open_reaps_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let registry_path = temp_dir.path().join("registry.db");
        let db_path = temp_dir.path().join("tiktok.sqlite");
        std::fs::write(&db_path, b"").unwrap();

        let run = {
            let fleet = FleetBuilder::new()
                .registry_path(&registry_path)
                .build()
                .unwrap();
            fleet.add("tiktok", "tiktok", &db_path).unwrap();
            let run = fleet.start_run("tiktok").unwrap();
            fleet
                .registry()
                .lock_conn()
                .unwrap()
                .execute(
                    "UPDATE runs SET pid = 999999999 WHERE id = ?1",
                    [run.id.0],
                )
                .unwrap();
            run
        };

        let fleet = FleetBuilder::new()
            .registry_path(&registry_path)
            .build()
            .unwrap();

        assert!(!fleet.ledger().get_run(run.id).unwrap().is_running());
    }
}
