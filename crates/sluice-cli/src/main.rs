mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sluice_engine::FailurePolicy;

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Transform and load execution engine for SQL step graphs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan
    Run {
        /// Path to plan YAML file
        plan: PathBuf,
        /// Override the plan's failure policy (fail_fast, continue)
        #[arg(long)]
        failure_policy: Option<FailurePolicy>,
        /// Override the maximum number of steps running at once
        #[arg(long)]
        parallelism: Option<usize>,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan and print its execution order
    Check {
        /// Path to plan YAML file
        plan: PathBuf,
    },
    /// List persisted watermarks for a plan's pipeline
    Watermarks {
        /// Path to plan YAML file
        plan: PathBuf,
        /// Print watermarks as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            plan,
            failure_policy,
            parallelism,
            json,
        } => commands::run::execute(&plan, failure_policy, parallelism, json).await,
        Commands::Check { plan } => commands::check::execute(&plan),
        Commands::Watermarks { plan, json } => commands::watermarks::execute(&plan, json),
    }
}
