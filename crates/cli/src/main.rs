//! Pipeline - pluggable content processing driven by a message broker
//!
//! Command-line entry point for the processing service.

use anyhow::Result;
use clap::{Parser, Subcommand};
use pipeline_cli::commands::check_config::CheckConfigCommand;
use pipeline_cli::commands::plugins::PluginsCommand;
use pipeline_cli::commands::run::RunCommand;
use pipeline_cli::commands::worker::WorkerCommand;
use pipeline_cli::init_logging;

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Pluggable content processing driven by a message broker",
    long_about = "Consume messages from a broker, fetch the referenced content and metadata,\n\
                  and dispatch them to every plugin that accepts the content type.\n\
                  Plugin results are queryable through the resource manager HTTP API.",
    after_help = "EXAMPLES:\n  \
                  # Validate a configuration\n  \
                  pipeline check-config --config config.yaml\n\n  \
                  # List plugins and their resources\n  \
                  pipeline plugins --config config.yaml\n\n  \
                  # Process messages until SIGINT or SIGTERM\n  \
                  pipeline run --config config.yaml\n\n  \
                  # Run a single plugin\n  \
                  PLUGIN=sizes pipeline run --config config.yaml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume messages and run plugins
    Run(RunCommand),

    /// List plugins, their accepted types and resources
    Plugins(PluginsCommand),

    /// Validate a configuration file
    CheckConfig(CheckConfigCommand),

    /// Run one plugin job read from stdin
    #[command(hide = true)]
    Worker(WorkerCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, matches!(cli.command, Commands::Worker(_)))?;

    match cli.command {
        Commands::Run(cmd) => cmd.execute().await,
        Commands::Plugins(cmd) => cmd.execute().await,
        Commands::CheckConfig(cmd) => cmd.execute().await,
        Commands::Worker(cmd) => cmd.execute().await,
    }
}
