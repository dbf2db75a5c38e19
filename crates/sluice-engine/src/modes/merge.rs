use sluice_types::schema::{find_column, TableInfo};
use sluice_types::step::Mode;

use super::{Materialization, ModeHandler, StatementPlan, StepContext};
use crate::errors::EngineError;
use crate::store::{column_list, quote_ident};

const MERGE_SOURCE: &str = "sluice_merge_src";
const SRC: &str = "s";
const DST: &str = "sluice_dst";

/// Upsert the new result by merge key.
///
/// The result is materialized once into a temporary table. Rows sharing a
/// key collapse to the last one in result order before the upsert runs.
/// Matching target rows get every non-key column overwritten; the rest are
/// inserted. Nothing is ever deleted from the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeHandler;

fn key_match(left: &str, right: &str, keys: &[String]) -> String {
    keys.iter()
        .map(|k| {
            let k = quote_ident(k);
            format!("{left}.{k} IS {right}.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl ModeHandler for MergeHandler {
    fn mode(&self) -> Mode {
        Mode::Merge
    }

    fn plan_statements(
        &self,
        ctx: &StepContext<'_>,
        table: &TableInfo,
    ) -> Result<StatementPlan, EngineError> {
        let Materialization::Merge { keys } = ctx.materialization else {
            return Err(EngineError::validation(&ctx.step.id, "merge handler needs merge keys"));
        };

        for key in keys {
            if find_column(ctx.incoming, key).is_none() {
                return Err(EngineError::validation(
                    &ctx.step.id,
                    format!("merge key '{key}' is not a column of the query result"),
                ));
            }
            if table.exists && table.column(key).is_none() {
                return Err(EngineError::validation(
                    &ctx.step.id,
                    format!("merge key '{key}' is not a column of table '{}'", table.name),
                ));
            }
        }

        let mut plan = StatementPlan::default();
        let source = format!("temp.{}", quote_ident(MERGE_SOURCE));
        let key_list = column_list(keys.iter().map(String::as_str));

        plan.push_ddl(format!("DROP TABLE IF EXISTS {source}"));
        plan.push_ddl(format!(
            "CREATE TEMP TABLE {} AS {}",
            quote_ident(MERGE_SOURCE),
            ctx.select_incoming()
        ));
        plan.push_ddl(format!(
            "DELETE FROM {source} WHERE rowid NOT IN \
             (SELECT MAX(rowid) FROM {source} GROUP BY {key_list})"
        ));

        let target = quote_ident(ctx.table());
        let src = quote_ident(SRC);
        let qualified_source = ctx
            .incoming
            .iter()
            .map(|c| format!("{src}.{}", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_select = format!("SELECT {qualified_source} FROM {source} AS {src}");

        if !table.exists {
            plan.push_ddl(ctx.create_target());
            plan.push_counted(ctx.insert_into(ctx.table(), &insert_select));
            return Ok(plan);
        }

        for sql in ctx.evolve(table)? {
            plan.push_ddl(sql);
        }

        let assignments: Vec<String> = ctx
            .incoming
            .iter()
            .filter(|c| !keys.iter().any(|k| c.is_named(k)))
            .map(|c| {
                let col = quote_ident(&c.name);
                format!("{col} = {src}.{col}")
            })
            .collect();
        if !assignments.is_empty() {
            plan.push_counted(format!(
                "UPDATE {target} SET {} FROM {source} AS {src} WHERE {}",
                assignments.join(", "),
                key_match(&target, &src, keys)
            ));
        }

        let dst = quote_ident(DST);
        plan.push_counted(format!(
            "{} WHERE NOT EXISTS (SELECT 1 FROM {target} AS {dst} WHERE {})",
            ctx.insert_into(ctx.table(), &insert_select),
            key_match(&dst, &src, keys)
        ));
        Ok(plan)
    }
}
