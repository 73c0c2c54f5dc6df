//! API implementation submodules.
//!
//! Each submodule contains `impl DatabaseFleet` blocks that extend the public
//! API with domain-specific methods. The struct definition remains in `lib.rs`.

mod builder;
mod content;
mod databases;
mod runs;

pub use builder::FleetBuilder;
