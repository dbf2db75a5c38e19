//! Per-step execution metrics.
//!
//! One [`StepMetric`] is emitted for every step that reaches a terminal
//! state, skipped steps included.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::step::StepId;

/// Lifecycle status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetric {
    pub pipeline: String,
    pub run_id: i64,
    pub step_id: StepId,
    /// Target table or sink reference.
    pub target: String,
    pub status: StepStatus,
    pub duration_secs: f64,
    pub rows_affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn metric_omits_absent_error() {
        let m = StepMetric {
            pipeline: "p".into(),
            run_id: 1,
            step_id: StepId::new("a"),
            target: "t".into(),
            status: StepStatus::Succeeded,
            duration_secs: 0.25,
            rows_affected: 3,
            error_kind: None,
            error_message: None,
        };
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("error_kind").is_none());
        assert_eq!(json["status"], "succeeded");
    }
}
