//! Plan document configuration: types, parsing and validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_config, parse_config_str, substitute_env_vars};
pub use types::{EngineConfig, ExecutionConfig, FailurePolicy, StateConfig, StoreConfig};
pub use validator::validate_config;
