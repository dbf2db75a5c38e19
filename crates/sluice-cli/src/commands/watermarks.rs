use std::path::Path;

use anyhow::{Context, Result};
use sluice_state::{SqliteStateStore, StateStore};
use sluice_types::state::PipelineId;

/// Execute the `watermarks` command: list persisted watermarks of the plan's pipeline.
pub fn execute(plan_path: &Path, json: bool) -> Result<()> {
    let config = super::load_plan(plan_path)?;
    let state_path = config.state_path();
    let state = SqliteStateStore::open_with_timeout(state_path, config.store.busy_timeout())
        .with_context(|| format!("Failed to open state store: {}", state_path.display()))?;

    let watermarks = state.list_watermarks(&PipelineId::new(config.pipeline.as_str()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&watermarks)?);
        return Ok(());
    }

    if watermarks.is_empty() {
        println!("No watermarks recorded for pipeline '{}'.", config.pipeline);
        return Ok(());
    }

    println!("{:24} {:20} {:28} UPDATED", "TABLE", "CURSOR", "VALUE");
    for wm in &watermarks {
        println!(
            "{:24} {:20} {:28} {}",
            wm.key.table, wm.key.cursor_column, wm.value, wm.last_updated
        );
    }
    Ok(())
}
