//! Step metrics sinks.
//!
//! Recording is fire-and-forget: a sink that cannot record logs the
//! failure and returns. Nothing here can fail a step.

use std::sync::{Arc, Mutex};

use sluice_state::StateStore;
use sluice_types::metric::{StepMetric, StepStatus};
use sluice_types::state::StepRunRecord;

/// Receives one metric per step that reaches a terminal state.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: &StepMetric);
}

/// Logs every metric through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, metric: &StepMetric) {
        match metric.status {
            StepStatus::Failed => tracing::warn!(
                pipeline = %metric.pipeline,
                run_id = metric.run_id,
                step = %metric.step_id,
                table = %metric.target,
                duration_secs = metric.duration_secs,
                error_kind = ?metric.error_kind,
                error = metric.error_message.as_deref().unwrap_or(""),
                "Step failed"
            ),
            status => tracing::info!(
                pipeline = %metric.pipeline,
                run_id = metric.run_id,
                step = %metric.step_id,
                table = %metric.target,
                status = %status,
                duration_secs = metric.duration_secs,
                rows = metric.rows_affected,
                "Step finished"
            ),
        }
    }
}

/// Collects metrics in memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    metrics: Mutex<Vec<StepMetric>>,
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StepMetric> {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl MetricsSink for InMemorySink {
    fn record(&self, metric: &StepMetric) {
        match self.metrics.lock() {
            Ok(mut metrics) => metrics.push(metric.clone()),
            Err(_) => tracing::warn!(step = %metric.step_id, "Metrics buffer poisoned, dropping metric"),
        }
    }
}

/// Writes step outcomes into the state store run history.
pub struct StateSink {
    state: Arc<dyn StateStore>,
}

impl StateSink {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }
}

impl MetricsSink for StateSink {
    fn record(&self, metric: &StepMetric) {
        let record = StepRunRecord {
            step_id: metric.step_id.clone(),
            status: metric.status,
            duration_secs: metric.duration_secs,
            rows_affected: metric.rows_affected,
            error_kind: metric.error_kind,
            error_message: metric.error_message.clone(),
        };
        if let Err(e) = self.state.record_step(metric.run_id, &record) {
            tracing::warn!(
                run_id = metric.run_id,
                step = %metric.step_id,
                error = %e,
                "Failed to record step in run history"
            );
        }
    }
}
