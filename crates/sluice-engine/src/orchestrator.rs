//! Run orchestrator: validates the plan, schedules ready steps onto a
//! bounded worker pool, leases targets, applies the failure policy and
//! records run history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use sluice_state::{SqliteStateStore, StateStore};
use sluice_types::metric::{StepMetric, StepStatus};
use sluice_types::state::{PipelineId, RunStats, RunStatus};
use sluice_types::step::{Step, StepId, StepKind};
use sluice_types::value::Params;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::types::DEFAULT_MAX_PARALLELISM;
use crate::config::{validate_config, EngineConfig, FailurePolicy};
use crate::connectors::ConnectorRegistry;
use crate::errors::EngineError;
use crate::locks::{LockManager, TableLease};
use crate::metrics::{MetricsSink, StateSink, TracingSink};
use crate::modes::{self, incoming_columns, step_query, Materialization, StepContext};
use crate::plan::ExecutionPlan;
use crate::result::{CheckResult, RunResult, StepExecutionResult, StepReport};
use crate::schema::SchemaEvolutionPolicy;
use crate::store::{column_ddl, quote_ident, SqliteTableStore, TableSession, TableStore};
use crate::watermark::WatermarkManager;

/// Lease key of a step. Sinks share the namespace under a `sink:` prefix.
fn lease_target(step: &Step) -> String {
    match step.kind {
        StepKind::Export => format!("sink:{}", step.target),
        StepKind::Load | StepKind::Transform => step.target.clone(),
    }
}

/// Executes one step on the blocking pool.
#[derive(Clone)]
struct StepWorker {
    pipeline: PipelineId,
    store: Arc<dyn TableStore>,
    state: Arc<dyn StateStore>,
    connectors: Arc<ConnectorRegistry>,
    watermarks: Arc<WatermarkManager>,
    policy: SchemaEvolutionPolicy,
}

impl StepWorker {
    fn execute(&self, step: &Step) -> Result<u64, EngineError> {
        if step.kind == StepKind::Export {
            let session = self.store.session()?;
            return self.export(step, session.as_ref());
        }

        // Mode parameters are checked before the store is touched.
        let materialization = Materialization::from_step(step)?;
        let session = self.store.session()?;
        let staged = match step.kind {
            StepKind::Load => Some(self.stage_source(step, session.as_ref())?),
            _ => None,
        };
        self.materialize(step, &materialization, session.as_ref(), staged.as_deref())
    }

    /// Read the source batch into a session-local temporary table.
    fn stage_source(&self, step: &Step, session: &dyn TableSession) -> Result<String, EngineError> {
        let reference = step.source.as_deref().unwrap_or_default();
        let (source, location) = self.connectors.source(reference)?;
        let batch = source
            .read(location)
            .map_err(|e| EngineError::Infrastructure(e.context(format!("step '{}' failed to read {reference}", step.id))))?;
        if batch.columns.is_empty() {
            return Err(EngineError::validation(
                &step.id,
                format!("source {reference} returned no columns"),
            ));
        }

        let staged = format!("sluice_load_{}", step.id);
        let defs = batch.columns.iter().map(column_ddl).collect::<Vec<_>>().join(", ");
        session.execute(
            &format!("DROP TABLE IF EXISTS temp.{}", quote_ident(&staged)),
            &Params::new(),
        )?;
        session.execute(
            &format!("CREATE TEMP TABLE {} ({defs})", quote_ident(&staged)),
            &Params::new(),
        )?;
        let rows = session.insert_rows(&staged, &batch)?;
        tracing::debug!(step = %step.id, source = reference, rows, "Staged source rows");
        Ok(staged)
    }

    fn materialize(
        &self,
        step: &Step,
        materialization: &Materialization,
        session: &dyn TableSession,
        staged: Option<&str>,
    ) -> Result<u64, EngineError> {
        let query = step_query(step, staged);
        let incoming = incoming_columns(step, &query, session)?;
        let table = session.get_schema(&step.target)?;

        let ctx = StepContext {
            pipeline: &self.pipeline,
            step,
            materialization,
            query: &query,
            incoming: &incoming,
            policy: self.policy,
            watermarks: &self.watermarks,
            session,
        };
        let rows = modes::materialize(&ctx, &table)?;

        match session.get_schema(&step.target) {
            Ok(info) => {
                if let Err(e) = self.state.put_schema_snapshot(&step.target, &info.columns) {
                    tracing::warn!(step = %step.id, error = %e, "Failed to store schema snapshot");
                }
            }
            Err(e) => tracing::warn!(step = %step.id, error = %e, "Failed to read schema for snapshot"),
        }
        Ok(rows)
    }

    fn export(&self, step: &Step, session: &dyn TableSession) -> Result<u64, EngineError> {
        let (sink, location) = self.connectors.sink(&step.target)?;
        let query = step_query(step, None);
        let batch = session
            .query(&query, &Params::new())
            .map_err(|e| EngineError::execution(&step.id, &step.target, "export", e))?;
        let rows = sink.write(location, &batch).map_err(|e| {
            EngineError::Infrastructure(e.context(format!("step '{}' failed to write {}", step.id, step.target)))
        })?;
        Ok(rows)
    }
}

/// Run blocking state-store work off the scheduler thread.
async fn blocking<T, F>(what: &'static str, f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Infrastructure(anyhow!("{what} task panicked: {e}")))?
}

/// Mutable bookkeeping of one run.
struct RunState {
    status: HashMap<StepId, StepStatus>,
    results: HashMap<StepId, StepExecutionResult>,
    remaining: HashMap<StepId, usize>,
    ready: VecDeque<StepId>,
    /// Metrics not yet handed to the sinks.
    outbox: Vec<StepMetric>,
}

impl RunState {
    fn new(plan: &ExecutionPlan) -> Self {
        let remaining = plan.in_degrees();
        let ready = plan
            .ordered_steps()
            .filter(|s| remaining.get(&s.id) == Some(&0))
            .map(|s| s.id.clone())
            .collect();
        Self {
            status: plan
                .ordered_steps()
                .map(|s| (s.id.clone(), StepStatus::Pending))
                .collect(),
            results: HashMap::new(),
            remaining,
            ready,
            outbox: Vec::new(),
        }
    }

    fn status(&self, id: &StepId) -> StepStatus {
        self.status.get(id).copied().unwrap_or(StepStatus::Pending)
    }

    fn count(&self, status: StepStatus) -> u64 {
        self.status.values().filter(|s| **s == status).count() as u64
    }
}

/// Executes plans against one table store.
pub struct Orchestrator {
    pipeline: PipelineId,
    store: Arc<dyn TableStore>,
    state: Arc<dyn StateStore>,
    metrics: Vec<Arc<dyn MetricsSink>>,
    connectors: Arc<ConnectorRegistry>,
    watermarks: Arc<WatermarkManager>,
    max_parallelism: usize,
    schema_policy: SchemaEvolutionPolicy,
}

impl Orchestrator {
    /// Orchestrator with tracing and run-history metrics, no connectors,
    /// default parallelism and default schema policy.
    pub fn new(
        pipeline: impl Into<PipelineId>,
        store: Arc<dyn TableStore>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            metrics: vec![Arc::new(TracingSink), Arc::new(StateSink::new(Arc::clone(&state)))],
            watermarks: Arc::new(WatermarkManager::new(Arc::clone(&state))),
            connectors: Arc::new(ConnectorRegistry::new()),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            schema_policy: SchemaEvolutionPolicy::default(),
            store,
            state,
        }
    }

    /// Add a metrics sink next to the built-in ones.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics.push(sink);
        self
    }

    #[must_use]
    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = Arc::new(connectors);
        self
    }

    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    #[must_use]
    pub fn with_schema_policy(mut self, policy: SchemaEvolutionPolicy) -> Self {
        self.schema_policy = policy;
        self
    }

    #[must_use]
    pub fn watermarks(&self) -> &WatermarkManager {
        &self.watermarks
    }

    fn worker(&self) -> StepWorker {
        StepWorker {
            pipeline: self.pipeline.clone(),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            connectors: Arc::clone(&self.connectors),
            watermarks: Arc::clone(&self.watermarks),
            policy: self.schema_policy,
        }
    }

    /// Run `steps` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Plan`] for invalid graphs, before any side
    /// effect, and [`EngineError::Infrastructure`] when run history cannot
    /// be written. Step failures are reported in the [`RunResult`].
    pub async fn run(&self, steps: Vec<Step>, failure_policy: FailurePolicy) -> Result<RunResult, EngineError> {
        self.run_with_cancel(steps, failure_policy, CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::run`]; once `cancel` fires no new step starts.
    /// Steps already running finish their transaction.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run`].
    pub async fn run_with_cancel(
        &self,
        steps: Vec<Step>,
        failure_policy: FailurePolicy,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let plan = ExecutionPlan::build(steps)?;
        let started = Instant::now();
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let run_id = blocking("start_run", move || Ok(state.start_run(&pipeline)?)).await?;

        tracing::info!(
            pipeline = %self.pipeline,
            run_id,
            steps = plan.len(),
            parallelism = self.max_parallelism,
            failure_policy = %failure_policy,
            "Starting run"
        );

        let mut run = RunState::new(&plan);
        let locks = LockManager::new();
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let mut join_set: JoinSet<(StepId, Result<u64, EngineError>, f64)> = JoinSet::new();
        let mut leases: HashMap<StepId, TableLease> = HashMap::new();
        let mut halted = false;
        let mut cancelled = false;

        loop {
            while !halted && !cancelled {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let Some(id) = run.ready.pop_front() else {
                    break;
                };
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    run.ready.push_front(id);
                    break;
                };
                let Some(step) = plan.step(&id).cloned() else {
                    continue;
                };

                let lease = match locks.acquire(&lease_target(&step), &id, |w| plan.is_ancestor(w, &id)) {
                    Ok(lease) => lease,
                    Err(err) => {
                        drop(permit);
                        halted |= self.finish_step(run_id, &plan, &mut run, &step, Err(err), 0.0, failure_policy);
                        continue;
                    }
                };
                leases.insert(id.clone(), lease);
                run.status.insert(id.clone(), StepStatus::Running);
                tracing::debug!(step = %id, kind = %step.kind, "Dispatching step");

                let worker = self.worker();
                let token = cancel.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let outcome = tokio::task::spawn_blocking(move || {
                        if token.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        worker.execute(&step)
                    })
                    .await
                    .map_err(|e| EngineError::Infrastructure(anyhow!("Step task panicked: {e}")))
                    .and_then(|r| r);
                    (id, outcome, started.elapsed().as_secs_f64())
                });
            }
            self.flush_metrics(&mut run).await;

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                () = cancel.cancelled(), if !cancelled => {
                    tracing::warn!(run_id, running = join_set.len(), "Run cancelled, waiting for running steps");
                    cancelled = true;
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((id, outcome, duration)) => {
                    if let Some(lease) = leases.remove(&id) {
                        locks.release(lease);
                    }
                    if let Some(step) = plan.step(&id) {
                        halted |= self.finish_step(run_id, &plan, &mut run, step, outcome, duration, failure_policy);
                    }
                }
                Err(join_err) => {
                    join_set.abort_all();
                    let err = EngineError::Infrastructure(anyhow!("Step task join error: {join_err}"));
                    let stats = RunStats {
                        error_message: Some(err.to_string()),
                        ..RunStats::default()
                    };
                    self.flush_metrics(&mut run).await;
                    self.complete_run(run_id, RunStatus::Failed, stats).await?;
                    return Err(err);
                }
            }
        }

        self.flush_metrics(&mut run).await;
        self.finish_run(run_id, &plan, run, cancel.is_cancelled(), started)
            .await
    }

    async fn complete_run(&self, run_id: i64, status: RunStatus, stats: RunStats) -> Result<(), EngineError> {
        let state = Arc::clone(&self.state);
        blocking("complete_run", move || Ok(state.complete_run(run_id, status, &stats)?)).await
    }

    /// Hand queued metrics to every sink on the blocking pool; sinks may
    /// write to the state store.
    async fn flush_metrics(&self, run: &mut RunState) {
        if run.outbox.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut run.outbox);
        let sinks = self.metrics.clone();
        let recorded = tokio::task::spawn_blocking(move || {
            for metric in &batch {
                for sink in &sinks {
                    sink.record(metric);
                }
            }
        })
        .await;
        if let Err(e) = recorded {
            tracing::warn!(error = %e, "Metrics task panicked");
        }
    }

    /// Record a step outcome and apply the failure policy. Returns whether
    /// dispatching must stop.
    #[allow(clippy::too_many_arguments)]
    fn finish_step(
        &self,
        run_id: i64,
        plan: &ExecutionPlan,
        run: &mut RunState,
        step: &Step,
        outcome: Result<u64, EngineError>,
        duration_secs: f64,
        failure_policy: FailurePolicy,
    ) -> bool {
        match outcome {
            Ok(rows) => {
                let result = StepExecutionResult::succeeded(rows, duration_secs);
                self.emit(run, run_id, step, StepStatus::Succeeded, Some(&result), None);
                run.status.insert(step.id.clone(), StepStatus::Succeeded);
                run.results.insert(step.id.clone(), result);

                for dependent in plan.dependents(&step.id) {
                    if let Some(left) = run.remaining.get_mut(dependent) {
                        *left = left.saturating_sub(1);
                        if *left == 0 && run.status(dependent) == StepStatus::Pending {
                            run.ready.push_back(dependent.clone());
                        }
                    }
                }
                false
            }
            Err(EngineError::Cancelled) => {
                tracing::debug!(step = %step.id, "Step not started, run cancelled");
                run.status.insert(step.id.clone(), StepStatus::Pending);
                false
            }
            Err(err) => {
                tracing::error!(step = %step.id, kind = %err.kind(), error = %err, "Step failed");
                let result = StepExecutionResult::failed(&err, duration_secs);
                self.emit(run, run_id, step, StepStatus::Failed, Some(&result), None);
                run.status.insert(step.id.clone(), StepStatus::Failed);
                run.results.insert(step.id.clone(), result);

                match failure_policy {
                    FailurePolicy::FailFast => true,
                    FailurePolicy::Continue => {
                        for dependent in plan.transitive_dependents(&step.id) {
                            if run.status(dependent) != StepStatus::Pending {
                                continue;
                            }
                            run.status.insert(dependent.clone(), StepStatus::Skipped);
                            if let Some(skipped) = plan.step(dependent) {
                                let note = format!("upstream step '{}' failed", step.id);
                                self.emit(run, run_id, skipped, StepStatus::Skipped, None, Some(note));
                            }
                        }
                        false
                    }
                }
            }
        }
    }

    fn emit(
        &self,
        run: &mut RunState,
        run_id: i64,
        step: &Step,
        status: StepStatus,
        result: Option<&StepExecutionResult>,
        note: Option<String>,
    ) {
        let failure = result.and_then(|r| r.failure.as_ref());
        let metric = StepMetric {
            pipeline: self.pipeline.to_string(),
            run_id,
            step_id: step.id.clone(),
            target: step.target.clone(),
            status,
            duration_secs: result.map_or(0.0, |r| r.duration_secs),
            rows_affected: result.map_or(0, |r| r.rows_affected),
            error_kind: failure.map(|f| f.kind),
            error_message: failure.map(|f| f.message.clone()).or(note),
        };
        run.outbox.push(metric);
    }

    async fn finish_run(
        &self,
        run_id: i64,
        plan: &ExecutionPlan,
        mut run: RunState,
        cancel_requested: bool,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        let pending = run.count(StepStatus::Pending);
        let stats = RunStats {
            steps_succeeded: run.count(StepStatus::Succeeded),
            steps_failed: run.count(StepStatus::Failed),
            steps_skipped: run.count(StepStatus::Skipped),
            steps_pending: pending,
            rows_affected: run.results.values().map(|r| r.rows_affected).sum(),
            error_message: plan
                .ordered_steps()
                .find_map(|s| run.results.get(&s.id).and_then(|r| r.failure.as_ref()))
                .map(|f| f.message.clone()),
        };

        let cancelled = cancel_requested && pending > 0;
        let success = stats.steps_failed == 0 && stats.steps_skipped == 0 && pending == 0;
        let status = if cancelled {
            RunStatus::Cancelled
        } else if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.complete_run(run_id, status, stats.clone()).await?;

        let duration_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            pipeline = %self.pipeline,
            run_id,
            status = %status,
            succeeded = stats.steps_succeeded,
            failed = stats.steps_failed,
            skipped = stats.steps_skipped,
            pending,
            rows = stats.rows_affected,
            duration_secs,
            "Run finished"
        );

        let steps = plan
            .ordered_steps()
            .map(|s| StepReport {
                step_id: s.id.clone(),
                target: s.target.clone(),
                status: run.status.get(&s.id).copied().unwrap_or(StepStatus::Pending),
                result: run.results.remove(&s.id),
            })
            .collect();

        Ok(RunResult {
            run_id,
            success,
            cancelled,
            duration_secs,
            steps,
        })
    }
}

/// Open the stores named by `config` and run its steps.
///
/// # Errors
///
/// Returns [`EngineError::Infrastructure`] when a store cannot be opened,
/// otherwise see [`Orchestrator::run`].
pub async fn run_pipeline(
    config: &EngineConfig,
    connectors: ConnectorRegistry,
    cancel: CancellationToken,
) -> Result<RunResult, EngineError> {
    let store = SqliteTableStore::open_with_timeout(&config.store.path, config.store.busy_timeout())?;
    let state = SqliteStateStore::open_with_timeout(config.state_path(), config.store.busy_timeout())?;

    let orchestrator = Orchestrator::new(config.pipeline.as_str(), Arc::new(store), Arc::new(state))
        .with_connectors(connectors)
        .with_max_parallelism(config.execution.max_parallelism)
        .with_schema_policy(config.schema_evolution);

    orchestrator
        .run_with_cancel(config.steps.clone(), config.execution.failure_policy, cancel)
        .await
}

/// Validate a plan document without running it: semantic checks, graph
/// order, connector resolution and store reachability.
///
/// # Errors
///
/// Returns an error listing every validation failure, or the plan error
/// when the graph cannot be ordered.
pub fn check_pipeline(config: &EngineConfig, connectors: &ConnectorRegistry) -> anyhow::Result<CheckResult> {
    tracing::info!(pipeline = %config.pipeline, "Checking plan document");
    validate_config(config)?;
    let plan = ExecutionPlan::build(config.steps.clone())?;

    let mut unresolved = Vec::new();
    for step in plan.ordered_steps() {
        let (reference, known) = match step.kind {
            StepKind::Load => {
                let reference = step.source.as_deref().unwrap_or_default();
                (reference, connectors.has_source(reference))
            }
            StepKind::Export => (step.target.as_str(), connectors.has_sink(&step.target)),
            StepKind::Transform => continue,
        };
        if !known {
            tracing::warn!(step = %step.id, reference, "No connector registered");
            unresolved.push(reference.to_string());
        }
    }

    let store_ok = match SqliteTableStore::open_with_timeout(&config.store.path, config.store.busy_timeout())
        .and_then(|store| store.session().map(drop))
    {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %config.store.path.display(), error = %e, "Table store unreachable");
            false
        }
    };
    let state_ok = match SqliteStateStore::open_with_timeout(config.state_path(), config.store.busy_timeout()) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(path = %config.state_path().display(), error = %e, "State store unreachable");
            false
        }
    };

    Ok(CheckResult {
        order: plan.ordered_steps().map(|s| s.id.clone()).collect(),
        unresolved_connectors: unresolved,
        store_ok,
        state_ok,
    })
}
