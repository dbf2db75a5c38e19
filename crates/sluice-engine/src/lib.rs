//! Transform and load execution engine for Sluice plans.
//!
//! Materializes SQL steps into tables under REPLACE, APPEND, MERGE and
//! INCREMENTAL semantics, tracks per-table watermarks, enforces the schema
//! evolution policy, and schedules step graphs with bounded parallelism.

pub mod config;
pub mod connectors;
pub mod errors;
pub mod locks;
pub mod metrics;
pub mod modes;
pub mod orchestrator;
pub mod plan;
pub mod result;
pub mod schema;
pub mod store;
pub mod watermark;

// Re-export public API for convenience
pub use config::{parse_config, validate_config, EngineConfig, FailurePolicy};
pub use connectors::ConnectorRegistry;
pub use errors::{EngineError, PlanError};
pub use metrics::{InMemorySink, MetricsSink, StateSink, TracingSink};
pub use orchestrator::{check_pipeline, run_pipeline, Orchestrator};
pub use plan::ExecutionPlan;
pub use result::{CheckResult, RunResult, StepExecutionResult, StepFailure, StepReport};
pub use schema::SchemaEvolutionPolicy;
pub use store::{SqliteTableStore, TableSession, TableStore};
pub use watermark::WatermarkManager;
