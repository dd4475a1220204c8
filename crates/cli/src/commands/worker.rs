//! Hidden worker entry point for process isolation
//!
//! The parent writes one job on stdin and reads one report line from stdout.
//! Logs go to stderr so they never mix with the report.

use super::registry_helper::{builtin_catalog, builtin_connectors};
use anyhow::{Context as _, Result};
use clap::Args;
use pipeline_core::worker::run_job;
use pipeline_core::Config;
use std::path::PathBuf;
use tracing::debug;

#[derive(Args)]
pub struct WorkerCommand {
    /// Configuration file of the parent pipeline
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Plugin to run
    #[arg(short, long)]
    plugin: String,
}

impl WorkerCommand {
    pub async fn execute(self) -> Result<()> {
        ignore_interrupts();

        let config = Config::load(&self.config)
            .with_context(|| format!("Failed to load configuration {}", self.config.display()))?;
        let report = run_job(
            &config,
            &builtin_catalog(),
            &builtin_connectors(),
            &self.plugin,
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
        .await
        .with_context(|| format!("Worker for {} failed", self.plugin))?;

        debug!("Worker for {} finished, failed: {}", self.plugin, report.failure.is_some());
        Ok(())
    }
}

/// Leave SIGINT to the parent, which owns shutdown and the job timeout
fn ignore_interrupts() {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Worker ignoring interrupt");
        }
    });
}
