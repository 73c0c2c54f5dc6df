//! Access to the content held by managed databases.
//!
//! The copy engine and the comparison reader only see the [`ContentStore`]
//! trait: ordered scans by row key, lookups by content id, batched inserts
//! and per-period counts. [`SqliteContentStore`] is the implementation for
//! collector databases; tests and other backends can plug in their own
//! [`ContentOpener`].

mod sqlite;

pub use sqlite::{SqliteContentOpener, SqliteContentStore};

use crate::error::Result;
use crate::models::{ContentRow, PeriodCount, TimeWindow};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::Path;

/// How a content store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// Creates the content table if the file has none yet.
    ReadWrite,
}

/// The content table of one managed database.
pub trait ContentStore: Send {
    /// Up to `limit` rows with a row key greater than `after`, in row-key order.
    fn scan_after(&mut self, after: Option<i64>, limit: usize) -> Result<Vec<ContentRow>>;

    /// The subset of `content_ids` already present.
    fn existing_ids(&mut self, content_ids: &[&str]) -> Result<HashSet<String>>;

    /// Insert rows atomically, ignoring content ids already present.
    /// Returns the number of rows actually inserted.
    fn insert_batch(&mut self, rows: &[ContentRow]) -> Result<usize>;

    fn row_count(&mut self) -> Result<u64>;

    /// Row counts per creation period, oldest first. Bounds are inclusive
    /// calendar days.
    fn created_per_period(
        &mut self,
        window: TimeWindow,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PeriodCount>>;
}

/// Opens content stores at resolved locations.
pub trait ContentOpener: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn ContentStore>>;
}
