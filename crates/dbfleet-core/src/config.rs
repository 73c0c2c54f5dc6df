//! Centralized configuration for the database fleet.
//!
//! Constants for the registry store, path probing, the run ledger and the
//! copy engine. Runtime overrides go through [`crate::FleetBuilder`].

use std::time::Duration;

/// Registry database configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const APP_CONFIG_DIR_NAME: &'static str = "dbfleet";
    pub const DB_FILENAME: &'static str = "registry.db";
    /// Environment variable overriding the default registry location.
    pub const REGISTRY_PATH_ENV: &'static str = "DBFLEET_REGISTRY";
    pub const BUSY_TIMEOUT_MS: u64 = 5_000;
    pub const SCHEMA_VERSION: u32 = 2;
}

/// Path probing configuration.
pub struct ResolverConfig;

impl ResolverConfig {
    /// Upper bound on a single existence/openability probe.
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Run ledger configuration.
pub struct LedgerConfig;

impl LedgerConfig {
    pub const RECENT_RUNS_DEFAULT_LIMIT: usize = 10;
    pub const ERROR_SUMMARY_MAX_CHARS: usize = 2_000;
}

/// Copy engine configuration.
pub struct MigrationConfig;

impl MigrationConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 500;
    /// Reattempts at resolving the target after a failed batch write.
    pub const TARGET_RESOLVE_ATTEMPTS: u32 = 3;
    pub const TARGET_RESOLVE_BACKOFF: Duration = Duration::from_millis(250);
    /// Metadata key recording which logical database a copied row came from.
    pub const ORIGIN_METADATA_KEY: &'static str = "orig_db";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ResolverConfig::PROBE_TIMEOUT > Duration::ZERO);
        assert!(RegistryConfig::BUSY_TIMEOUT_MS >= 1_000);
        assert!(MigrationConfig::DEFAULT_BATCH_SIZE > 0);
        assert!(MigrationConfig::TARGET_RESOLVE_ATTEMPTS > 0);
    }
}
