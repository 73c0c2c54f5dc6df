//! Run ledger methods for DatabaseFleet.

use crate::error::Result;
use crate::models::{RunId, RunState, RunStatus};
use crate::DatabaseFleet;

impl DatabaseFleet {
    /// Begin a collection run. At most one run per database is running.
    pub fn start_run(&self, database_id: &str) -> Result<RunState> {
        self.ledger.start_run(database_id)
    }

    pub fn end_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        item_count: u64,
        error: Option<&str>,
    ) -> Result<RunState> {
        self.ledger.end_run(run_id, status, item_count, error)
    }

    pub fn active_run(&self, database_id: &str) -> Result<Option<RunState>> {
        self.ledger.active_run(database_id)
    }

    pub fn reap_orphaned_runs(&self) -> Result<Vec<RunState>> {
        self.ledger.reap_orphaned_runs()
    }
}
