//! Error classification shared by reports, metrics and run history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a step or run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid plan graph (duplicate ids, unknown dependencies, cycles).
    Plan,
    /// Conflicting writers of the same table.
    Concurrency,
    /// Incoming result shape cannot be applied to the target.
    SchemaIncompatible,
    /// Invalid mode parameters (keys, cursor, lookback).
    Validation,
    /// Store rejected a generated statement.
    Execution,
    /// Run was cancelled before the step started.
    Cancelled,
    /// State store, connector, or runtime failure.
    Infrastructure,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Concurrency => "concurrency",
            Self::SchemaIncompatible => "schema_incompatible",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Cancelled => "cancelled",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        let json = serde_json::to_string(&ErrorKind::SchemaIncompatible).unwrap();
        assert_eq!(json, "\"schema_incompatible\"");
        assert_eq!(ErrorKind::SchemaIncompatible.to_string(), "schema_incompatible");
    }
}
