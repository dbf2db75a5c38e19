//! Step and run result types.

use serde::Serialize;
use sluice_types::error::ErrorKind;
use sluice_types::metric::StepStatus;
use sluice_types::step::StepId;

use crate::errors::EngineError;

/// Classified failure of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for StepFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a step that ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepExecutionResult {
    pub status: StepStatus,
    pub rows_affected: u64,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl StepExecutionResult {
    #[must_use]
    pub fn succeeded(rows_affected: u64, duration_secs: f64) -> Self {
        Self {
            status: StepStatus::Succeeded,
            rows_affected,
            duration_secs,
            failure: None,
        }
    }

    #[must_use]
    pub fn failed(err: &EngineError, duration_secs: f64) -> Self {
        Self {
            status: StepStatus::Failed,
            rows_affected: 0,
            duration_secs,
            failure: Some(err.into()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Per-step line of the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step_id: StepId,
    /// Target table or sink reference.
    pub target: String,
    pub status: StepStatus,
    /// Present for steps that ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepExecutionResult>,
}

impl StepReport {
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.result.as_ref().map_or(0, |r| r.rows_affected)
    }

    #[must_use]
    pub fn failure(&self) -> Option<&StepFailure> {
        self.result.as_ref().and_then(|r| r.failure.as_ref())
    }
}

/// Aggregate result of one run, steps in plan order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: i64,
    pub success: bool,
    pub cancelled: bool,
    pub duration_secs: f64,
    pub steps: Vec<StepReport>,
}

impl RunResult {
    /// Report for one step.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id.as_str() == id)
    }

    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.steps.iter().map(StepReport::rows_affected).sum()
    }

    /// Failed step reports, in plan order.
    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }
}

/// Outcome of a dry check of a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Step ids in the order a serial run would execute them.
    pub order: Vec<StepId>,
    /// Source or sink references with no registered connector.
    pub unresolved_connectors: Vec<String>,
    pub store_ok: bool,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.unresolved_connectors.is_empty() && self.store_ok && self.state_ok
    }
}
