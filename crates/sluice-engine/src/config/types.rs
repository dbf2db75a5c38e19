//! Plan document types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_types::step::Step;

use crate::schema::SchemaEvolutionPolicy;

/// Default number of steps that may run at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 4;
/// Default store busy timeout, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Top-level plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub schema_evolution: SchemaEvolutionPolicy,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("sluice.db")
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Table store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// State store location. Shares the table store file when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// What happens to the rest of the run when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching; unstarted steps stay pending.
    #[default]
    FailFast,
    /// Skip the failed step's dependents; independent branches keep going.
    Continue,
}

impl FailurePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::Continue => "continue",
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown failure policy '{other}', expected fail_fast or continue")),
        }
    }
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
        }
    }
}

impl EngineConfig {
    /// State store path, falling back to the table store file.
    #[must_use]
    pub fn state_path(&self) -> &std::path::Path {
        self.state.path.as_deref().unwrap_or(&self.store.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let config: EngineConfig = serde_yaml::from_str("version: \"1.0\"\npipeline: p\n").unwrap();
        assert_eq!(config.store.path, PathBuf::from("sluice.db"));
        assert_eq!(config.store.busy_timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.execution.max_parallelism, DEFAULT_MAX_PARALLELISM);
        assert_eq!(config.state_path(), std::path::Path::new("sluice.db"));
        assert!(config.steps.is_empty());
    }

    #[test]
    fn failure_policy_parses_cli_spellings() {
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!("CONTINUE".parse::<FailurePolicy>().unwrap(), FailurePolicy::Continue);
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
