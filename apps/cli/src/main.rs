//! Maestro CLI - Command-line driver for the Maestro orchestration core
//!
//! The `maestro` binary loads workflow bundles (scripted agents plus a
//! workflow definition) from JSON files and validates, runs or routes them.

mod bundle;
mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use commands::{assign, run, validate};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Maestro CLI - Multi-agent workflow orchestration
#[derive(Parser, Debug)]
#[command(
    name = "maestro",
    author,
    version,
    about = "Maestro - Multi-agent workflow orchestration",
    long_about = "Maestro validates and executes declarative multi-agent workflows.\nBundles describe scripted agents and a workflow definition in JSON."
)]
struct Args {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a workflow bundle
    ///
    /// Parses the bundle and checks the workflow definition's structure,
    /// dependency graph and conditions without running anything.
    Validate {
        /// Path to the bundle file
        bundle: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow bundle to completion
    ///
    /// Registers the bundle's scripted agents, executes the workflow and
    /// prints a per-step summary.
    Run {
        /// Path to the bundle file
        bundle: PathBuf,

        /// Orchestrator configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output the workflow result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Pick the best agent from a bundle for a free-text task
    Assign {
        /// Path to the bundle file
        bundle: PathBuf,

        /// Task description
        task: String,

        /// Required agent type
        #[arg(long)]
        agent_type: Option<String>,

        /// Required capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Output the selection as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.without_time().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);

    let ok = match args.command {
        Command::Validate { bundle, json } => validate::execute(&bundle, json)?,
        Command::Run { bundle, config, json } => run::execute(&bundle, config.as_deref(), json).await?,
        Command::Assign { bundle, task, agent_type, capabilities, json } => {
            assign::execute(&bundle, &task, agent_type, capabilities, json).await?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
