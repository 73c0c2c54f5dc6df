//! Registry of managed databases.
//!
//! A single SQLite file holds:
//! - **Database records**: logical id, kind, primary path and lifecycle status
//! - **Alternative paths**: ordered fallback locations per database
//! - **Runs**: collection runs, owned by [`crate::ledger::RunLedger`]
//! - **Migration checkpoints**: resumable copy progress
//!
//! Every mutation runs in one `BEGIN IMMEDIATE` transaction, so concurrent
//! processes on the same host serialize on the SQLite write lock and each
//! observes either all or none of another's change.
//!
//! # Location
//!
//! Unless overridden by `$DBFLEET_REGISTRY` the registry lives at:
//! - **Linux**: `~/.config/dbfleet/registry.db`
//! - **Windows**: `%APPDATA%\dbfleet\registry.db`
//! - **macOS**: `~/Library/Application Support/dbfleet/registry.db`

pub mod store;

pub use store::{RegistryStore, StatusReport};
