//! Pipeline command-line interface
//!
//! The binary lives in `main.rs`; the commands are exposed here so the
//! end-to-end tests can drive a pipeline in-process.

pub mod commands;

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins over `verbose`. Workers log to stderr because stdout
/// carries their report.
pub fn init_logging(verbose: bool, stderr: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to set tracing subscriber: {e}"))
}
