use sluice_types::schema::TableInfo;
use sluice_types::step::Mode;

use super::{ModeHandler, StatementPlan, StepContext};
use crate::errors::EngineError;

/// Insert the new result after the existing rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendHandler;

impl ModeHandler for AppendHandler {
    fn mode(&self) -> Mode {
        Mode::Append
    }

    fn plan_statements(
        &self,
        ctx: &StepContext<'_>,
        table: &TableInfo,
    ) -> Result<StatementPlan, EngineError> {
        let mut plan = StatementPlan::default();

        if table.exists {
            for sql in ctx.evolve(table)? {
                plan.push_ddl(sql);
            }
        } else {
            plan.push_ddl(ctx.create_target());
        }

        plan.push_counted(ctx.insert_into(ctx.table(), &ctx.select_incoming()));
        Ok(plan)
    }
}
