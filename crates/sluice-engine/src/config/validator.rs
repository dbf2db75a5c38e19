//! Semantic validation for parsed plan documents.

use std::collections::HashSet;

use anyhow::{bail, Result};
use sluice_types::step::{Step, StepKind};

use crate::config::types::EngineConfig;
use crate::modes::Materialization;
use crate::plan::ExecutionPlan;

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Shape checks for one step that do not depend on other steps.
fn validate_step(step: &Step, errors: &mut Vec<String>) {
    let ctx = format!("step '{}'", step.id);

    if step.target.trim().is_empty() {
        let what = if step.kind == StepKind::Export { "sink reference" } else { "target table" };
        errors.push(format!("{ctx}: {what} (target) must not be empty"));
    }

    match step.kind {
        StepKind::Load => {
            if is_blank(step.source.as_deref()) {
                errors.push(format!("{ctx}: load steps require a source reference"));
            }
            if step.sql.is_some() {
                errors.push(format!("{ctx}: load steps take a source, not sql"));
            }
        }
        StepKind::Transform | StepKind::Export => {
            if is_blank(step.sql.as_deref()) {
                errors.push(format!("{ctx}: {} steps require sql", step.kind));
            }
        }
    }

    if step.kind == StepKind::Export {
        if step.mode.is_some() {
            errors.push(format!("{ctx}: export steps do not take a mode"));
        }
        return;
    }

    if let Err(e) = Materialization::from_step(step) {
        let message = match e {
            crate::errors::EngineError::Validation { message, .. } => message,
            other => other.to_string(),
        };
        errors.push(format!("{ctx}: {message}"));
    }

    if step.depends_on.iter().any(|d| *d == step.id) {
        errors.push(format!("{ctx}: depends on itself"));
    }
}

/// Validate a parsed plan document.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the document.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported plan version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.execution.max_parallelism == 0 {
        errors.push("execution.max_parallelism must be at least 1".to_string());
    }

    if config.store.path.as_os_str().is_empty() {
        errors.push("store.path must not be empty".to_string());
    }

    if config.steps.is_empty() {
        errors.push("Plan must contain at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for step in &config.steps {
        if step.id.as_str().trim().is_empty() {
            errors.push("Step id must not be empty".to_string());
            continue;
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step id '{}'", step.id));
        }
        validate_step(step, &mut errors);
    }

    for step in &config.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}': depends on unknown step '{dep}'",
                    step.id
                ));
            }
        }
    }

    // Cycles only once the graph itself is well formed.
    if errors.is_empty() {
        if let Err(e) = ExecutionPlan::build(config.steps.clone()) {
            errors.push(e.to_string());
        }
    }

    if !errors.is_empty() {
        bail!("Plan validation failed:\n  - {}", errors.join("\n  - "));
    }

    Ok(())
}
