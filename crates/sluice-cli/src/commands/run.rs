use std::path::Path;

use anyhow::Result;
use sluice_engine::{run_pipeline, validate_config, FailurePolicy, RunResult};
use sluice_types::metric::StepStatus;
use tokio_util::sync::CancellationToken;

/// Execute the `run` command: parse, validate, and run a plan.
pub async fn execute(
    plan_path: &Path,
    failure_policy: Option<FailurePolicy>,
    parallelism: Option<usize>,
    json: bool,
) -> Result<()> {
    // 1. Parse plan document, command-line overrides win
    let mut config = super::load_plan(plan_path)?;
    if let Some(policy) = failure_policy {
        config.execution.failure_policy = policy;
    }
    if let Some(parallelism) = parallelism {
        config.execution.max_parallelism = parallelism;
    }

    // 2. Validate
    validate_config(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        steps = config.steps.len(),
        failure_policy = %config.execution.failure_policy,
        parallelism = config.execution.max_parallelism,
        "Plan validated"
    );

    // 3. Run, Ctrl-C stops dispatching new steps
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing running steps");
            on_signal.cancel();
        }
    });

    let result = run_pipeline(&config, super::bundled_connectors(), cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_report(&config.pipeline, &result);
    }

    if result.success {
        Ok(())
    } else if result.cancelled {
        anyhow::bail!("Run {} cancelled", result.run_id)
    } else {
        anyhow::bail!(
            "Run {} finished with {} failed and {} skipped step(s)",
            result.run_id,
            result.count(StepStatus::Failed),
            result.count(StepStatus::Skipped)
        )
    }
}

fn print_report(pipeline: &str, result: &RunResult) {
    let outcome = if result.success {
        "completed successfully"
    } else if result.cancelled {
        "was cancelled"
    } else {
        "failed"
    };
    println!("Plan '{pipeline}' {outcome} (run {}).", result.run_id);
    for step in &result.steps {
        let duration = step
            .result
            .as_ref()
            .map_or(String::new(), |r| format!("{:.2}s", r.duration_secs));
        println!(
            "  {:24} {:10} {:>10} rows {:>8}  -> {}",
            step.step_id.as_str(),
            step.status.as_str(),
            step.rows_affected(),
            duration,
            step.target
        );
        if let Some(failure) = step.failure() {
            println!("    [{}] {}", failure.kind, failure.message);
        }
    }
    println!("  Rows affected:   {}", result.rows_affected());
    println!("  Duration:        {:.2}s", result.duration_secs);
}
