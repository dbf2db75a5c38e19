use std::path::Path;

use anyhow::Result;
use sluice_engine::check_pipeline;

/// Execute the `check` command: validate the plan and print its execution order.
pub fn execute(plan_path: &Path) -> Result<()> {
    // 1. Parse plan document
    let config = super::load_plan(plan_path)?;

    // 2. Validate structure, connectors and stores
    let result = check_pipeline(&config, &super::bundled_connectors())?;
    println!("Plan structure:    OK");

    // 3. Report results
    println!("Execution order:");
    for (i, id) in result.order.iter().enumerate() {
        println!("  {:>3}. {id}", i + 1);
    }

    if result.unresolved_connectors.is_empty() {
        println!("Connectors:        OK");
    } else {
        println!("Connectors:        FAILED");
        for reference in &result.unresolved_connectors {
            println!("  no connector for {reference}");
        }
    }
    println!("Table store:       {}", if result.store_ok { "OK" } else { "FAILED" });
    println!("State store:       {}", if result.state_ok { "OK" } else { "FAILED" });

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
