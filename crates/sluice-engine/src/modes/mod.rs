//! Materialization mode handlers.
//!
//! Each handler turns a step and the current [`TableInfo`] into a
//! [`StatementPlan`]. [`apply`] then runs the plan inside one transaction on
//! the step's session. Handlers are looked up in a static table keyed by
//! [`Mode`].

mod append;
mod incremental;
mod merge;
mod replace;

use sluice_types::cursor::{CursorKind, CursorValue, Lookback};
use sluice_types::schema::{ColumnDef, TableInfo};
use sluice_types::state::{PipelineId, WatermarkKey};
use sluice_types::step::{Mode, Step, StepKind};
use sluice_types::value::{Params, Value};

pub use append::AppendHandler;
pub use incremental::{IncrementalHandler, END_PARAM, START_PARAM};
pub use merge::MergeHandler;
pub use replace::ReplaceHandler;

use crate::errors::EngineError;
use crate::schema::{SchemaCompatibility, SchemaEvolutionPolicy};
use crate::store::{column_list, create_table_sql, quote_ident, query_body, TableSession};
use crate::watermark::WatermarkManager;

/// Alias for the subquery wrapping the step query.
pub(crate) const SOURCE_ALIAS: &str = "sluice_src";

/// Typed, validated mode parameters of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialization {
    Replace,
    Append,
    Merge {
        keys: Vec<String>,
    },
    Incremental {
        cursor_column: String,
        lookback: Lookback,
        until: Option<String>,
    },
}

impl Materialization {
    /// Derive and validate the materialization of a load or transform step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] when required mode parameters are
    /// missing or malformed, or when called on an export step.
    pub fn from_step(step: &Step) -> Result<Self, EngineError> {
        let Some(mode) = step.effective_mode() else {
            return Err(EngineError::validation(
                &step.id,
                format!("{} steps have no materialization mode", step.kind),
            ));
        };
        match mode {
            Mode::Replace => Ok(Self::Replace),
            Mode::Append => Ok(Self::Append),
            Mode::Merge => {
                let keys: Vec<String> = step
                    .merge_keys
                    .iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if keys.is_empty() {
                    return Err(EngineError::validation(
                        &step.id,
                        "merge mode requires at least one merge key",
                    ));
                }
                for (i, key) in keys.iter().enumerate() {
                    if keys[..i].iter().any(|k| k.eq_ignore_ascii_case(key)) {
                        return Err(EngineError::validation(
                            &step.id,
                            format!("merge key '{key}' is listed more than once"),
                        ));
                    }
                }
                Ok(Self::Merge { keys })
            }
            Mode::Incremental => {
                let cursor_column = step
                    .cursor_column
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        EngineError::validation(&step.id, "incremental mode requires a cursor column")
                    })?
                    .to_string();
                let lookback = Lookback::parse_opt(step.lookback.as_deref())
                    .map_err(|e| EngineError::validation(&step.id, e.to_string()))?;
                Ok(Self::Incremental {
                    cursor_column,
                    lookback,
                    until: step.until.clone(),
                })
            }
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Self::Replace => Mode::Replace,
            Self::Append => Mode::Append,
            Self::Merge { .. } => Mode::Merge,
            Self::Incremental { .. } => Mode::Incremental,
        }
    }
}

/// Everything a handler needs to plan one step.
pub struct StepContext<'a> {
    pub pipeline: &'a PipelineId,
    pub step: &'a Step,
    pub materialization: &'a Materialization,
    /// Query producing the incoming rows, without a trailing `;`.
    pub query: &'a str,
    /// Incoming result columns, declared or described.
    pub incoming: &'a [ColumnDef],
    pub policy: SchemaEvolutionPolicy,
    pub watermarks: &'a WatermarkManager,
    pub session: &'a dyn TableSession,
}

impl StepContext<'_> {
    #[must_use]
    pub fn table(&self) -> &str {
        &self.step.target
    }

    fn execution_error(&self, message: impl std::fmt::Display) -> EngineError {
        EngineError::execution(&self.step.id, self.table(), self.materialization.mode(), message)
    }

    /// Columns of the incoming result, by name.
    fn incoming_names(&self) -> impl Iterator<Item = &str> {
        self.incoming.iter().map(|c| c.name.as_str())
    }

    /// `SELECT <incoming columns> FROM (<query>) AS "sluice_src"`.
    fn select_incoming(&self) -> String {
        format!(
            "SELECT {} FROM ({}) AS {}",
            column_list(self.incoming_names()),
            self.query,
            quote_ident(SOURCE_ALIAS)
        )
    }

    /// `INSERT INTO <table> (<cols>) <select>`.
    fn insert_into(&self, table: &str, select: &str) -> String {
        format!(
            "INSERT INTO {} ({}) {select}",
            quote_ident(table),
            column_list(self.incoming_names())
        )
    }

    /// Run the evolution check against an existing table.
    ///
    /// Returns the migration statements for compatible changes.
    fn evolve(&self, table: &TableInfo) -> Result<Vec<String>, EngineError> {
        let compatibility: SchemaCompatibility = self.policy.check(&table.columns, self.incoming);
        if !compatibility.is_compatible() {
            return Err(EngineError::SchemaIncompatible {
                table: table.name.clone(),
                issues: compatibility.incompatibilities(),
            });
        }
        if !compatibility.is_empty() {
            tracing::info!(
                step = %self.step.id,
                table = %table.name,
                changes = compatibility.changes.len(),
                "Applying schema evolution"
            );
        }
        Ok(compatibility.migration_statements(&table.name, &table.columns))
    }

    fn create_target(&self) -> String {
        create_table_sql(self.table(), self.incoming)
    }
}

/// One statement of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    /// Whether the rows this statement changes count towards the step total.
    pub counts_rows: bool,
}

impl Statement {
    pub fn ddl(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            counts_rows: false,
        }
    }

    pub fn counted(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            counts_rows: true,
        }
    }
}

/// Query run after the statements, before commit, to find the highest
/// cursor value written by the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorProbe {
    pub sql: String,
    pub key: WatermarkKey,
    pub kind: Option<CursorKind>,
}

/// Statements and bound parameters produced by a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementPlan {
    pub statements: Vec<Statement>,
    pub params: Params,
    pub cursor_probe: Option<CursorProbe>,
}

impl StatementPlan {
    pub fn push_ddl(&mut self, sql: impl Into<String>) {
        self.statements.push(Statement::ddl(sql));
    }

    pub fn push_counted(&mut self, sql: impl Into<String>) {
        self.statements.push(Statement::counted(sql));
    }
}

/// Converts a step and the current table state into statements.
pub trait ModeHandler: Send + Sync {
    fn mode(&self) -> Mode;

    /// Build the statements for one step.
    ///
    /// Runs before the step transaction opens; may read watermarks and table
    /// metadata through the session but must not write.
    ///
    /// # Errors
    ///
    /// Returns validation and schema errors detected before any write.
    fn plan_statements(
        &self,
        ctx: &StepContext<'_>,
        table: &TableInfo,
    ) -> Result<StatementPlan, EngineError>;
}

/// Indexed by `Mode as usize`.
static HANDLERS: [&dyn ModeHandler; 4] = [
    &ReplaceHandler,
    &AppendHandler,
    &MergeHandler,
    &IncrementalHandler,
];

/// Handler registered for `mode`.
#[must_use]
pub fn handler_for(mode: Mode) -> &'static dyn ModeHandler {
    HANDLERS[mode as usize]
}

/// Outcome of a successfully committed plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub rows_affected: u64,
    /// Highest cursor value written, when the plan carried a probe.
    pub max_cursor: Option<Value>,
}

/// Execute `plan` in one transaction. Any failure rolls the whole step back.
///
/// # Errors
///
/// Returns [`EngineError::Execution`] carrying step, table and mode context.
pub fn apply(plan: &StatementPlan, ctx: &StepContext<'_>) -> Result<Applied, EngineError> {
    let session = ctx.session;
    session.begin().map_err(|e| ctx.execution_error(e))?;

    let run = || -> Result<Applied, crate::store::StoreError> {
        let mut rows_affected = 0u64;
        for statement in &plan.statements {
            let changed = session.execute(&statement.sql, &plan.params)?;
            if statement.counts_rows {
                rows_affected += changed;
            }
        }
        let max_cursor = match &plan.cursor_probe {
            Some(probe) => session.query_scalar(&probe.sql, &plan.params)?,
            None => None,
        };
        Ok(Applied {
            rows_affected,
            max_cursor,
        })
    };

    match run() {
        Ok(applied) => {
            session.commit().map_err(|e| {
                let _ = session.rollback();
                ctx.execution_error(e)
            })?;
            Ok(applied)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback() {
                tracing::error!(
                    step = %ctx.step.id,
                    error = %rollback_err,
                    "Rollback failed"
                );
            }
            Err(ctx.execution_error(err))
        }
    }
}

fn probed_cursor(value: Value, kind: Option<CursorKind>) -> Result<CursorValue, EngineError> {
    match (value, kind) {
        (Value::Integer(v), _) => Ok(CursorValue::Integer(v)),
        (Value::Real(v), _) => Ok(CursorValue::Real(v)),
        (other, Some(kind)) => CursorValue::parse(kind, &other.to_text())
            .map_err(|e| EngineError::Infrastructure(anyhow::anyhow!("cursor probe: {e}"))),
        (other, None) => Ok(CursorValue::infer(&other.to_text())),
    }
}

/// Plan, apply and, for incremental steps, advance the watermark after
/// commit. Returns rows affected.
///
/// # Errors
///
/// Propagates planning, execution and watermark errors.
pub fn materialize(ctx: &StepContext<'_>, table: &TableInfo) -> Result<u64, EngineError> {
    let handler = handler_for(ctx.materialization.mode());
    let plan = handler.plan_statements(ctx, table)?;
    tracing::debug!(
        step = %ctx.step.id,
        mode = %handler.mode(),
        statements = plan.statements.len(),
        "Planned statements"
    );

    let applied = apply(&plan, ctx)?;

    if let (Some(probe), Some(max)) = (&plan.cursor_probe, applied.max_cursor) {
        let value = probed_cursor(max, probe.kind)?;
        ctx.watermarks.advance(&probe.key, &value)?;
    }
    Ok(applied.rows_affected)
}

/// Result columns for a step: the declared ones, else described from the
/// query.
///
/// # Errors
///
/// Returns [`EngineError::Execution`] when the query does not prepare and
/// [`EngineError::Validation`] when it yields no columns.
pub fn incoming_columns(
    step: &Step,
    query: &str,
    session: &dyn TableSession,
) -> Result<Vec<ColumnDef>, EngineError> {
    let columns = match &step.columns {
        Some(declared) => declared.clone(),
        None => session.describe_query(query).map_err(|e| {
            let mode = step.effective_mode().map_or("export", Mode::as_str);
            EngineError::execution(&step.id, &step.target, mode, e)
        })?,
    };
    if columns.is_empty() {
        return Err(EngineError::validation(&step.id, "query returns no columns"));
    }
    Ok(columns)
}

/// Body of a transform step's query, or the staged relation of a load step.
#[must_use]
pub fn step_query(step: &Step, staged: Option<&str>) -> String {
    match (step.kind, staged) {
        (StepKind::Load, Some(table)) => format!("SELECT * FROM temp.{}", quote_ident(table)),
        _ => query_body(step.sql.as_deref().unwrap_or_default()).to_string(),
    }
}
