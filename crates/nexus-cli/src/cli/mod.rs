//! CLI command definitions for the `nexus` binary.
//!
//! Uses clap derive macros for argument parsing. Every command prints
//! pretty JSON on stdout; logs go to stderr.

pub mod tasks;
pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use nexus_types::workflow::ExecutionMode;

use tasks::TaskCommand;

/// Plan and run multi-service workflows, and inspect background tasks.
#[derive(Parser)]
#[command(name = "nexus", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "NEXUS_CONFIG", default_value = "nexus.toml")]
    pub config: PathBuf,

    /// Detailed logs (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a candidate step list and print the resulting plan.
    Plan(PlanArgs),

    /// Plan and execute a workflow against the configured services.
    Run(RunArgs),

    /// Inspect and maintain stored tasks.
    Tasks {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Check connectivity to the backing store.
    Health,
}

/// Arguments shared by `plan` and `run`.
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// JSON file holding `{steps, confidence, clarifications}`.
    pub candidate: PathBuf,

    /// The original request text recorded on the plan.
    #[arg(long)]
    pub request: Option<String>,

    /// Failure policy.
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Plan-level timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Record the run as a task in the backing store.
    #[arg(long)]
    pub track: bool,

    /// Execute even when the planner asks for clarification.
    #[arg(long)]
    pub force: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Strict,
    BestEffort,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Strict => ExecutionMode::Strict,
            ModeArg::BestEffort => ExecutionMode::BestEffort,
        }
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "nexus", "run", "plan.json", "--mode", "best-effort", "--timeout-ms", "5000", "--track", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.plan.mode, Some(ModeArg::BestEffort));
        assert_eq!(args.plan.timeout_ms, Some(5000));
        assert!(args.track);
        assert!(!args.force);
    }

    #[test]
    fn test_tasks_list_defaults() {
        let cli = Cli::try_parse_from(["nexus", "--config", "x.toml", "tasks", "list"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(
            cli.command,
            Commands::Tasks {
                command: TaskCommand::List { limit: 20, cursor: None }
            }
        ));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["nexus", "plan", "p.json", "--mode", "lenient"]).is_err());
    }

    #[test]
    fn test_mode_conversion() {
        assert_eq!(ExecutionMode::from(ModeArg::BestEffort), ExecutionMode::BestEffort);
    }
}
