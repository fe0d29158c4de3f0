//! Nexus orchestrator CLI entry point.
//!
//! Binary name: `nexus`
//!
//! Parses CLI arguments, initializes tracing and configuration, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use nexus_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "info,nexus_core=debug,nexus_infra=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        otel: cli.otel,
        json: cli.log_json,
        default_filter: default_filter.to_string(),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(&cli.config).await;

    let outcome = match cli.command {
        Commands::Plan(args) => cli::workflow::handle_plan(args, &state).await,
        Commands::Run(args) => cli::workflow::handle_run(args, &state).await,
        Commands::Tasks { command } => cli::tasks::handle_task_command(command, &state).await,
        Commands::Health => cli::tasks::handle_health(&state).await,
    };

    shutdown_tracing();
    outcome
}
