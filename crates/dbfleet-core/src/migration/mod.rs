//! Copying content between managed databases.
//!
//! - `engine` - batched, deduplicating, resumable copy
//! - `checkpoint` - per source/target progress stored in the registry

mod checkpoint;
pub mod engine;

pub use checkpoint::MigrationCheckpoint;
pub use engine::{CopyOptions, CopyReport, InterruptReason, MigrationEngine, MigrationPlan};
