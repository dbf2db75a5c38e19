//! State store model types.
//!
//! Pure data types used by `StateStore` implementations. Kept in the types
//! crate so the state and engine crates share them without a cycle.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::metric::StepStatus;
use crate::step::StepId;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    /// Create a new pipeline identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

/// Identity of a watermark: one per (pipeline, table, cursor column).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub pipeline: PipelineId,
    pub table: String,
    pub cursor_column: String,
}

impl WatermarkKey {
    #[must_use]
    pub fn new(
        pipeline: impl Into<PipelineId>,
        table: impl Into<String>,
        cursor_column: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            table: table.into(),
            cursor_column: cursor_column.into(),
        }
    }
}

impl std::fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.pipeline, self.table, self.cursor_column)
    }
}

/// Persisted high-water mark.
///
/// `value` is the serialized cursor (ISO-8601 for temporal cursors);
/// `last_updated` is an ISO-8601 UTC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub key: WatermarkKey,
    pub value: String,
    pub last_updated: String,
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub steps_pending: u64,
    pub rows_affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One step outcome in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub step_id: StepId,
    pub status: StepStatus,
    pub duration_secs: f64,
    pub rows_affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Summary row of a recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub pipeline: PipelineId,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_id_display_and_as_str() {
        let pid = PipelineId::new("daily");
        assert_eq!(pid.as_str(), "daily");
        assert_eq!(pid.to_string(), "daily");
        assert_eq!(serde_json::to_string(&pid).unwrap(), "\"daily\"");
    }

    #[test]
    fn watermark_keys_sort_by_pipeline_then_table() {
        let mut keys = vec![
            WatermarkKey::new("weekly", "a", "day"),
            WatermarkKey::new("daily", "orders", "id"),
            WatermarkKey::new("daily", "events", "day"),
        ];
        keys.sort();
        let order: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(order, vec!["daily/events.day", "daily/orders.id", "weekly/a.day"]);
    }

    #[test]
    fn watermark_key_display() {
        let key = WatermarkKey::new("daily", "orders", "updated_at");
        assert_eq!(key.to_string(), "daily/orders.updated_at");
    }

    #[test]
    fn run_status_serde_matches_as_str() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn run_stats_default_is_zeroed() {
        let stats = RunStats::default();
        assert_eq!(stats.steps_succeeded, 0);
        assert_eq!(stats.rows_affected, 0);
        assert!(stats.error_message.is_none());
    }
}
