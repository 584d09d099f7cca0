//! # gk-cli
//!
//! Operator command-line interface for Gatekeeper:
//! - `gk policy validate/check`: lint a policy file, dry-run a decision
//! - `gk config validate`: load an engine configuration end to end
//! - `gk trace verify/tail`: inspect a JSONL execution trace

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Gatekeeper: policy enforcement for agent tool calls.
#[derive(Parser)]
#[command(name = "gk", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate policies and dry-run decisions.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Check engine configuration files.
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommands,
    },
    /// Inspect execution traces.
    Trace {
        #[command(subcommand)]
        command: commands::trace::TraceCommands,
    },
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Policy { command } => commands::policy::execute(command),
        Commands::Config { command } => commands::config::execute(command),
        Commands::Trace { command } => commands::trace::execute(command),
    }
}
