//! Plan step model.
//!
//! A [`Step`] is the unit of work handed to the engine by an external
//! planner. Steps are plain data: mode parameters are validated later, when
//! the engine derives a typed materialization from them.

use serde::{Deserialize, Serialize};

use crate::schema::ColumnDef;

/// Unique step identifier within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Create a new step identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for StepId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Pull rows from a source connector into a table.
    Load,
    /// Materialize a SQL query into a table.
    Transform,
    /// Push query results to a sink connector.
    Export,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Transform => "transform",
            Self::Export => "export",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialization strategy for load and transform steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Swap the table contents with the new result.
    Replace,
    /// Insert the new result after the existing rows.
    Append,
    /// Upsert the new result by merge key.
    Merge,
    /// Delete and re-insert the cursor window since the last watermark.
    Incremental,
}

impl Mode {
    /// All modes, in handler-table order.
    pub const ALL: [Mode; 4] = [Mode::Replace, Mode::Append, Mode::Merge, Mode::Incremental];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Merge => "merge",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single plan step as produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Target table for load/transform steps; sink reference for exports.
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_column: Option<String>,
    /// Late-arrival tolerance, e.g. `"2 days"` or `"100"` for sequence cursors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback: Option<String>,
    /// Upper bound of the incremental window. Defaults to "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Source connector reference (`scheme:location`) for load steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Declared result schema; overrides the inferred one when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnDef>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
}

impl Step {
    /// Minimal step of the given kind; remaining fields are defaulted.
    #[must_use]
    pub fn new(id: impl Into<StepId>, kind: StepKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: target.into(),
            mode: None,
            merge_keys: Vec::new(),
            cursor_column: None,
            lookback: None,
            until: None,
            sql: None,
            source: None,
            columns: None,
            depends_on: Vec::new(),
        }
    }

    /// Builder-style transform step.
    #[must_use]
    pub fn transform(id: impl Into<StepId>, target: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepKind::Transform, target);
        step.sql = Some(sql.into());
        step
    }

    /// Builder-style load step.
    #[must_use]
    pub fn load(id: impl Into<StepId>, target: impl Into<String>, source: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepKind::Load, target);
        step.source = Some(source.into());
        step
    }

    /// Builder-style export step.
    #[must_use]
    pub fn export(id: impl Into<StepId>, sink: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepKind::Export, sink);
        step.sql = Some(sql.into());
        step
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_merge_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, column: impl Into<String>, lookback: Option<&str>) -> Self {
        self.cursor_column = Some(column.into());
        self.lookback = lookback.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_until(mut self, until: impl Into<String>) -> Self {
        self.until = Some(until.into());
        self
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = Some(columns);
        self
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Mode that applies to this step, `Replace` when none is declared.
    ///
    /// Exports have no mode.
    #[must_use]
    pub fn effective_mode(&self) -> Option<Mode> {
        match self.kind {
            StepKind::Export => None,
            StepKind::Load | StepKind::Transform => Some(self.mode.unwrap_or(Mode::Replace)),
        }
    }
}
