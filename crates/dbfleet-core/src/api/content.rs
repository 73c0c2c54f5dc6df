//! Migration and comparison methods for DatabaseFleet.

use crate::analytics::{CollectedDay, PeriodComparison};
use crate::error::Result;
use crate::migration::{CopyOptions, CopyReport, MigrationPlan};
use crate::models::{PeriodCount, RunState, TimeWindow};
use crate::DatabaseFleet;
use chrono::NaiveDate;

impl DatabaseFleet {
    /// Copy content missing from `target_id` over from `source_id`.
    pub fn copy_metadata_content(
        &self,
        source_id: &str,
        target_id: &str,
        options: &CopyOptions,
    ) -> Result<CopyReport> {
        self.migrations
            .copy_metadata_content(source_id, target_id, options)
    }

    pub fn plan_copy(&self, source_id: &str, target_id: &str) -> Result<MigrationPlan> {
        self.migrations.plan(source_id, target_id)
    }

    pub fn posts_per_period(
        &self,
        database_id: &str,
        window: TimeWindow,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PeriodCount>> {
        self.reader.posts_per_period(database_id, window, start, end)
    }

    pub fn collected_per_day(&self, database_id: &str) -> Result<Vec<CollectedDay>> {
        self.reader.collected_per_day(database_id)
    }

    pub fn compare(
        &self,
        left_id: &str,
        right_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<PeriodComparison>> {
        self.reader.compare(left_id, right_id, window, None, None)
    }

    pub fn recent(&self, database_id: &str, limit: Option<usize>) -> Result<Vec<RunState>> {
        self.reader.recent(database_id, limit)
    }
}
