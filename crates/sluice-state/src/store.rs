//! State store trait definition.
//!
//! [`StateStore`] defines the storage contract for watermarks, schema
//! snapshots, and run history. Model types live in
//! [`sluice_types::state`].

use sluice_types::schema::ColumnDef;
use sluice_types::state::{
    PipelineId, RunRecord, RunStats, RunStatus, StepRunRecord, Watermark, WatermarkKey,
};

use crate::error;

/// Storage contract for pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Read the watermark for a (pipeline, table, cursor column) key.
    ///
    /// Returns `Ok(None)` when no watermark has been persisted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_watermark(&self, key: &WatermarkKey) -> error::Result<Option<Watermark>>;

    /// Upsert the watermark value for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_watermark(&self, key: &WatermarkKey, value: &str) -> error::Result<()>;

    /// Compare-and-set: update the value only if it currently equals `expected`.
    ///
    /// When `expected` is `None`, succeeds only if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn compare_and_set_watermark(
        &self,
        key: &WatermarkKey,
        expected: Option<&str>,
        new_value: &str,
    ) -> error::Result<bool>;

    /// All watermarks of a pipeline, ordered by table then cursor column.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_watermarks(&self, pipeline: &PipelineId) -> error::Result<Vec<Watermark>>;

    /// Store the last applied column set of a table.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_schema_snapshot(&self, table: &str, columns: &[ColumnDef]) -> error::Result<()>;

    /// Read the last stored column set of a table.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_schema_snapshot(&self, table: &str) -> error::Result<Option<Vec<ColumnDef>>>;

    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Append one step outcome to a run's history.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn record_step(&self, run_id: i64, step: &StepRunRecord) -> error::Result<()>;

    /// Read a run summary.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>>;

    /// Step outcomes recorded for a run, in recording order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_step_runs(&self, run_id: i64) -> error::Result<Vec<StepRunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateStore) {}
    }
}
