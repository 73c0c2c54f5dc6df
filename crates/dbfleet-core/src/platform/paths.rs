//! Platform-specific path utilities.

use crate::config::RegistryConfig;
use crate::error::{FleetError, Result};
use std::path::{Component, Path, PathBuf};

/// Get the fleet's global configuration directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/dbfleet` (XDG_CONFIG_HOME)
/// - **Windows**: `%APPDATA%\dbfleet`
/// - **macOS**: `~/Library/Application Support/dbfleet`
pub fn fleet_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| FleetError::Config {
        message: "Could not determine platform config directory".to_string(),
    })?;
    Ok(config_dir.join(RegistryConfig::APP_CONFIG_DIR_NAME))
}

/// Get the path to the registry database.
///
/// `$DBFLEET_REGISTRY` wins when set and non-empty; otherwise
/// `{fleet_config_dir}/registry.db`.
pub fn registry_db_path() -> Result<PathBuf> {
    match std::env::var_os(RegistryConfig::REGISTRY_PATH_ENV) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => Ok(fleet_config_dir()?.join(RegistryConfig::DB_FILENAME)),
    }
}

/// Validate and normalize a managed-database location.
///
/// The path must be absolute and must not contain `..` components. It does
/// not need to exist. `.` components, repeated separators and trailing
/// separators are dropped so that equal locations compare equal.
pub fn normalize_db_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(FleetError::invalid_path(path, "path is empty"));
    }
    if path.to_string_lossy().contains('\0') {
        return Err(FleetError::invalid_path(path, "path contains a NUL byte"));
    }
    if !path.is_absolute() {
        return Err(FleetError::invalid_path(path, "path must be absolute"));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(FleetError::invalid_path(
                    path,
                    "path must not contain '..' components",
                ));
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    Ok(normalized)
}
