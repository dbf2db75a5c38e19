//! Engine error model.
//!
//! Every failure a step can produce maps to one [`ErrorKind`] so reports,
//! metrics and run history classify it the same way.

use sluice_types::error::ErrorKind;
use sluice_types::step::StepId;

use crate::store::StoreError;

/// Invalid plan graph. Raised before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(StepId),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("dependency cycle detected involving step '{0}'")]
    Cycle(StepId),
    #[error("step '{step}': {message}")]
    InvalidStep { step: StepId, message: String },
}

/// Categorized engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("concurrency conflict on '{target}': {message}")]
    Concurrency { target: String, message: String },

    #[error("incompatible schema change for table '{table}': {}", .issues.join("; "))]
    SchemaIncompatible { table: String, issues: Vec<String> },

    #[error("invalid parameters for step '{step}': {message}")]
    Validation { step: StepId, message: String },

    #[error("step '{step}' ({mode}) failed on '{table}': {message}")]
    Execution {
        step: StepId,
        table: String,
        mode: String,
        message: String,
    },

    #[error("run cancelled before step started")]
    Cancelled,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(step: &StepId, message: impl Into<String>) -> Self {
        Self::Validation {
            step: step.clone(),
            message: message.into(),
        }
    }

    pub fn execution(
        step: &StepId,
        table: &str,
        mode: impl std::fmt::Display,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Execution {
            step: step.clone(),
            table: table.to_string(),
            mode: mode.to_string(),
            message: message.to_string(),
        }
    }

    /// Report classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Plan(_) => ErrorKind::Plan,
            Self::Concurrency { .. } => ErrorKind::Concurrency,
            Self::SchemaIncompatible { .. } => ErrorKind::SchemaIncompatible,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl From<sluice_state::StateError> for EngineError {
    fn from(e: sluice_state::StateError) -> Self {
        Self::Infrastructure(e.into())
    }
}
