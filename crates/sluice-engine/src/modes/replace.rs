use sluice_types::schema::TableInfo;
use sluice_types::step::Mode;

use super::{ModeHandler, StatementPlan, StepContext};
use crate::errors::EngineError;
use crate::schema::resolve_column_types;
use crate::store::{create_table_sql, quote_ident};

/// Swap the table contents with the new result.
///
/// An existing table is rebuilt in a staging table that is renamed into
/// place, all inside the step transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceHandler;

impl ModeHandler for ReplaceHandler {
    fn mode(&self) -> Mode {
        Mode::Replace
    }

    fn plan_statements(
        &self,
        ctx: &StepContext<'_>,
        table: &TableInfo,
    ) -> Result<StatementPlan, EngineError> {
        let mut plan = StatementPlan::default();
        let select = ctx.select_incoming();

        if !table.exists {
            plan.push_ddl(ctx.create_target());
            plan.push_counted(ctx.insert_into(ctx.table(), &select));
            return Ok(plan);
        }

        let stage = format!("sluice_stage_{}", ctx.table());
        let columns = resolve_column_types(ctx.incoming, &table.columns);
        plan.push_ddl(format!("DROP TABLE IF EXISTS {}", quote_ident(&stage)));
        plan.push_ddl(create_table_sql(&stage, &columns));
        plan.push_counted(ctx.insert_into(&stage, &select));
        plan.push_ddl(format!("DROP TABLE {}", quote_ident(ctx.table())));
        plan.push_ddl(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&stage),
            quote_ident(ctx.table())
        ));
        Ok(plan)
    }
}
