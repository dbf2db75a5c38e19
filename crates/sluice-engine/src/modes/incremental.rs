use chrono::Utc;
use sluice_types::cursor::{CursorError, CursorKind, CursorValue};
use sluice_types::schema::{find_column, TableInfo};
use sluice_types::state::WatermarkKey;
use sluice_types::step::Mode;
use sluice_types::value::Value;

use super::{CursorProbe, Materialization, ModeHandler, StatementPlan, StepContext, SOURCE_ALIAS};
use crate::errors::EngineError;
use crate::store::{column_list, quote_ident};
use crate::watermark::max_cursor_sql;

/// Lower bound parameter name, usable from step SQL as `:sluice_start`.
pub const START_PARAM: &str = "sluice_start";
/// Upper bound parameter name, usable from step SQL as `:sluice_end`.
pub const END_PARAM: &str = "sluice_end";

const INC_SOURCE: &str = "sluice_inc_src";

/// Delete and re-insert the cursor window since the last watermark.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalHandler;

fn bound_value(value: Option<&CursorValue>) -> Value {
    match value {
        None => Value::Null,
        Some(CursorValue::Integer(v)) => Value::Integer(*v),
        Some(CursorValue::Real(v)) => Value::Real(*v),
        Some(other) => Value::Text(other.render()),
    }
}

/// `[start, end]` predicate over `column`. Temporal cursors compare through
/// `julianday` so dates and timestamps order together.
fn window_predicate(column: &str, kind: Option<CursorKind>) -> String {
    let (start, end) = (format!(":{START_PARAM}"), format!(":{END_PARAM}"));
    if kind.is_some_and(CursorKind::is_temporal) {
        format!(
            "({start} IS NULL OR julianday({column}) >= julianday({start})) \
             AND ({end} IS NULL OR julianday({column}) <= julianday({end}))"
        )
    } else {
        format!(
            "({start} IS NULL OR {column} >= {start}) \
             AND ({end} IS NULL OR {column} <= {end})"
        )
    }
}

impl ModeHandler for IncrementalHandler {
    fn mode(&self) -> Mode {
        Mode::Incremental
    }

    fn plan_statements(
        &self,
        ctx: &StepContext<'_>,
        table: &TableInfo,
    ) -> Result<StatementPlan, EngineError> {
        let Materialization::Incremental {
            cursor_column,
            lookback,
            until,
        } = ctx.materialization
        else {
            return Err(EngineError::validation(&ctx.step.id, "incremental handler needs a cursor"));
        };
        let invalid = |e: CursorError| EngineError::validation(&ctx.step.id, e.to_string());

        let Some(incoming_cursor) = find_column(ctx.incoming, cursor_column) else {
            return Err(EngineError::validation(
                &ctx.step.id,
                format!("cursor column '{cursor_column}' is not a column of the query result"),
            ));
        };

        let mut kind = CursorKind::from_column_type(&incoming_cursor.data_type).or_else(|| {
            table
                .column(cursor_column)
                .and_then(|c| CursorKind::from_column_type(&c.data_type))
        });
        if let Some(kind) = kind {
            lookback.check_kind(kind).map_err(invalid)?;
        }

        let key = WatermarkKey::new(ctx.pipeline.clone(), ctx.table(), cursor_column.as_str());
        let watermark = ctx.watermarks.get(&key, kind, ctx.session, table.exists)?;
        if kind.is_none() {
            kind = watermark.as_ref().map(CursorValue::kind);
        }

        let start = match &watermark {
            Some(w) => Some(w.rewind(lookback).map_err(invalid)?),
            None => None,
        };
        let end = match (until.as_deref(), kind) {
            (Some(raw), Some(kind)) => Some(CursorValue::parse(kind, raw).map_err(invalid)?),
            (Some(raw), None) => Some(CursorValue::infer(raw)),
            (None, Some(kind)) if kind.is_temporal() => Some(CursorValue::Timestamp(Utc::now())),
            (None, _) => None,
        };
        if let (Some(s), Some(e)) = (&start, &end) {
            if s > e {
                return Err(EngineError::validation(
                    &ctx.step.id,
                    format!("window start {s} is after end {e}"),
                ));
            }
        }

        tracing::info!(
            step = %ctx.step.id,
            watermark = ?watermark.as_ref().map(CursorValue::render),
            start = ?start.as_ref().map(CursorValue::render),
            end = ?end.as_ref().map(CursorValue::render),
            lookback = %lookback,
            "Computed incremental window"
        );

        let mut plan = StatementPlan::default();
        plan.params.insert(START_PARAM.to_string(), bound_value(start.as_ref()));
        plan.params.insert(END_PARAM.to_string(), bound_value(end.as_ref()));

        let cursor = quote_ident(cursor_column);
        let source = format!("temp.{}", quote_ident(INC_SOURCE));
        plan.push_ddl(format!("DROP TABLE IF EXISTS {source}"));
        plan.push_ddl(format!(
            "CREATE TEMP TABLE {} AS {} WHERE {}",
            quote_ident(INC_SOURCE),
            ctx.select_incoming(),
            window_predicate(&format!("{}.{cursor}", quote_ident(SOURCE_ALIAS)), kind)
        ));

        let target = quote_ident(ctx.table());
        if table.exists {
            for sql in ctx.evolve(table)? {
                plan.push_ddl(sql);
            }
            plan.push_ddl(format!(
                "DELETE FROM {target} WHERE {}",
                window_predicate(&format!("{target}.{cursor}"), kind)
            ));
        } else {
            plan.push_ddl(ctx.create_target());
        }

        plan.push_counted(format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM {source}",
            cols = column_list(ctx.incoming.iter().map(|c| c.name.as_str()))
        ));

        plan.cursor_probe = Some(CursorProbe {
            sql: max_cursor_sql(&format!("temp.{INC_SOURCE}"), cursor_column, kind),
            key,
            kind,
        });
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_predicate_uses_julianday() {
        let p = window_predicate("\"day\"", Some(CursorKind::Date));
        assert!(p.contains("julianday(\"day\") >= julianday(:sluice_start)"));
        assert!(p.contains(":sluice_end IS NULL"));
    }

    #[test]
    fn integer_predicate_compares_directly() {
        let p = window_predicate("\"seq\"", Some(CursorKind::Integer));
        assert!(p.contains("\"seq\" >= :sluice_start"));
        assert!(!p.contains("julianday"));
    }

    #[test]
    fn bounds_bind_typed_values() {
        assert_eq!(bound_value(None), Value::Null);
        assert_eq!(bound_value(Some(&CursorValue::Integer(7))), Value::Integer(7));
        assert_eq!(bound_value(Some(&CursorValue::Real(9.5))), Value::Real(9.5));
        let day = CursorValue::parse(CursorKind::Date, "2024-01-08").unwrap();
        assert_eq!(bound_value(Some(&day)), Value::Text("2024-01-08".into()));
    }
}
