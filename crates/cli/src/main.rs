//! Experimentation engine daemon
//!
//! Runs the background significance scheduler and offers operator commands
//! for evaluating experiment snapshots offline.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{ConfigCommand, EvaluateCommand, RunCommand};
use experiment_config::{EngineConfig, ObservabilityConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "experimentd",
    version,
    about = "A/B experimentation engine",
    long_about = "Runs the experiment scheduler and evaluates experiment snapshots.\n\n\
                  Configuration is read from an optional YAML file and \
                  EXPERIMENT_-prefixed environment variables."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "EXPERIMENTD_CONFIG",
        value_name = "FILE",
        help = "Path to configuration file"
    )]
    config: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background scheduler
    #[command(name = "run", about = "Run the experiment scheduler")]
    Run(RunCommand),

    /// Evaluate an experiment snapshot
    #[command(name = "evaluate", about = "Evaluate significance for an experiment file")]
    Evaluate(EvaluateCommand),

    /// Show effective configuration
    #[command(name = "config", about = "Print the effective configuration")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.clone())?;
    init_tracing(&config.observability, cli.verbose);

    match cli.command {
        Commands::Run(command) => command.execute(&config).await,
        Commands::Evaluate(command) => command.execute(&config),
        Commands::Config(command) => command.execute(&config),
    }
}

/// Initialize tracing/logging
fn init_tracing(observability: &ObservabilityConfig, verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("decision=debug,experimentd=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&observability.log_level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
