//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here:
//! - `paths` - registry location and managed-database path validation
//! - `process` - liveness of the processes that own collection runs

pub mod paths;
pub mod process;

pub use paths::{fleet_config_dir, normalize_db_path, registry_db_path};
pub use process::{current_host, is_process_alive};
