//! Resolution of a managed database to a currently reachable location.
//!
//! The primary path is tried first, then alternative paths in ascending
//! priority. The first location that answers a probe wins. Results are never
//! cached: removable media may come and go between two calls.
//!
//! Probes are bounded. A location whose probe does not answer within the
//! timeout counts as unreachable; the stalled probe thread is left to finish
//! on its own.

use crate::config::ResolverConfig;
use crate::error::{FleetError, Result};
use crate::models::DatabaseLocations;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Existence/openability check for a candidate location.
pub trait PathProbe: Send + Sync {
    /// Return true if `path` exists and can be opened right now.
    fn probe(&self, path: &Path) -> bool;
}

/// Filesystem probe: the path must be a regular file that opens for reading,
/// answered within a timeout. Directories never count: no content store can
/// be opened on one.
#[derive(Debug, Clone)]
pub struct FsProbe {
    timeout: Duration,
}

impl FsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn check(path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => std::fs::File::open(path).is_ok(),
            _ => false,
        }
    }
}

impl Default for FsProbe {
    fn default() -> Self {
        Self::new(ResolverConfig::PROBE_TIMEOUT)
    }
}

impl PathProbe for FsProbe {
    fn probe(&self, path: &Path) -> bool {
        let (tx, rx) = mpsc::channel();
        let owned = path.to_path_buf();
        let spawned = std::thread::Builder::new()
            .name("dbfleet-probe".to_string())
            .spawn(move || {
                let _ = tx.send(Self::check(&owned));
            });
        if let Err(e) = spawned {
            warn!("Could not spawn probe thread, probing inline: {}", e);
            return Self::check(path);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(reachable) => reachable,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "Probe of {} did not answer within {:?}",
                    path.display(),
                    self.timeout
                );
                false
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Which candidate a resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathSource {
    Primary,
    Alternative { priority: i64 },
}

/// A reachable location for a managed database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPath {
    pub database_id: String,
    pub path: PathBuf,
    pub source: PathSource,
}

/// Outcome of resolving one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(ResolvedPath),
    Unreachable { tried: Vec<PathBuf> },
}

impl Resolution {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Resolved(resolved) => Some(&resolved.path),
            Resolution::Unreachable { .. } => None,
        }
    }

    /// Convert to a hard requirement, for operations that need a working copy.
    pub fn require(self, id: &str) -> Result<ResolvedPath> {
        match self {
            Resolution::Resolved(resolved) => Ok(resolved),
            Resolution::Unreachable { tried } => Err(FleetError::DatabaseUnreachable {
                id: id.to_string(),
                tried,
            }),
        }
    }
}

/// Picks the first reachable candidate location of a database.
#[derive(Clone)]
pub struct PathResolver {
    probe: Arc<dyn PathProbe>,
}

impl PathResolver {
    pub fn new(probe: Arc<dyn PathProbe>) -> Self {
        Self { probe }
    }

    /// Resolver using [`FsProbe`] with the given probe timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Arc::new(FsProbe::new(timeout)))
    }

    pub fn resolve(&self, locations: &DatabaseLocations) -> Resolution {
        let id = &locations.record.id;
        let mut tried = Vec::new();

        let primary = &locations.record.primary_path;
        if self.probe.probe(primary) {
            return Resolution::Resolved(ResolvedPath {
                database_id: id.clone(),
                path: primary.clone(),
                source: PathSource::Primary,
            });
        }
        debug!("Primary path of {} unreachable: {}", id, primary.display());
        tried.push(primary.clone());

        for alt in &locations.alternatives {
            if self.probe.probe(&alt.path) {
                debug!(
                    "Resolved {} to alternative {} (priority {})",
                    id,
                    alt.path.display(),
                    alt.priority
                );
                return Resolution::Resolved(ResolvedPath {
                    database_id: id.clone(),
                    path: alt.path.clone(),
                    source: PathSource::Alternative {
                        priority: alt.priority,
                    },
                });
            }
            tried.push(alt.path.clone());
        }

        warn!("No reachable location for {} ({} tried)", id, tried.len());
        Resolution::Unreachable { tried }
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(Arc::new(FsProbe::default()))
    }
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver").finish_non_exhaustive()
    }
}
