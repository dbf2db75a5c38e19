pub mod check;
pub mod run;
pub mod watermarks;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sluice_connectors::{CsvSink, CsvSource, CSV_SCHEME};
use sluice_engine::{parse_config, ConnectorRegistry, EngineConfig};

/// Parse a plan document, naming the file on failure.
fn load_plan(plan_path: &Path) -> Result<EngineConfig> {
    parse_config(plan_path).with_context(|| format!("Failed to parse plan: {}", plan_path.display()))
}

/// Connectors bundled with the binary. Scheme-less references are files.
fn bundled_connectors() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    for scheme in [CSV_SCHEME, "file"] {
        registry.register_source(scheme, Arc::new(CsvSource::new()));
        registry.register_sink(scheme, Arc::new(CsvSink::new()));
    }
    registry
}
