//! Worker side of process isolation
//!
//! A worker is spawned by [`crate::executor::ProcessExecutor`] for one plugin
//! invocation. It rebuilds that single plugin with a fresh database handle,
//! runs the job read from stdin and prints a [`WorkerReport`] on stdout.

use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::executor::{PluginExecutor, TaskExecutor, WorkerJob, WorkerReport};
use crate::plugin::PluginCatalog;
use crate::registry::PluginRegistry;
use pipeline_common::{FailureKind, PluginFailure};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid worker job: {0}")]
    InvalidJob(#[from] serde_json::Error),

    #[error("Job is for plugin {job}, worker was started for {expected}")]
    PluginMismatch { expected: String, job: String },
}

/// Read one job, run it and write the report
///
/// Plugin failures, including failures to build the plugin, end up in the
/// report. Only a broken job or channel is returned as an error.
pub async fn run_job<R, W>(
    config: &Config,
    catalog: &PluginCatalog,
    connectors: &ConnectorRegistry,
    plugin: &str,
    mut input: R,
    mut output: W,
) -> Result<WorkerReport, WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    input.read_to_end(&mut raw).await?;
    let worker_job: WorkerJob = serde_json::from_slice(&raw)?;
    if worker_job.plugin != plugin {
        return Err(WorkerError::PluginMismatch {
            expected: plugin.to_string(),
            job: worker_job.plugin,
        });
    }
    debug!("Worker received job for {} on {}", plugin, worker_job.job.message.label());

    let failure = match PluginRegistry::load_plugin(config, catalog, connectors, plugin, false).await {
        Ok(descriptor) => TaskExecutor.execute(&descriptor, worker_job.job).await.err(),
        Err(e) => {
            warn!("Worker could not load plugin {}: {}", plugin, e);
            Some(PluginFailure::new(plugin, FailureKind::Error, e.to_string()))
        }
    };

    let report = WorkerReport {
        plugin: plugin.to_string(),
        failure,
    };
    let mut line = serde_json::to_vec(&report)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PluginJob;
    use crate::registry::tests::{catalog, connectors};
    use pipeline_common::{Message, Metadata};
    use std::io::Write;

    fn job_bytes(plugin: &str, path: &std::path::Path) -> Vec<u8> {
        serde_json::to_vec(&WorkerJob {
            plugin: plugin.to_string(),
            job: PluginJob {
                message: Message::new(path.display().to_string()),
                metadata: Metadata::new(),
                content_path: path.to_path_buf(),
            },
        })
        .unwrap()
    }

    fn config() -> Config {
        Config::from_yaml_str("database:\n  type: memory\n").unwrap()
    }

    #[tokio::test]
    async fn test_run_job_reports_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        let input = job_bytes("sizes", file.path());
        let mut output = Vec::new();

        let report = run_job(&config(), &catalog(&["sizes"]), &connectors(), "sizes", input.as_slice(), &mut output)
            .await
            .unwrap();
        assert_eq!(report.failure, None);

        let written: WorkerReport = serde_json::from_slice(&output).unwrap();
        assert_eq!(written, report);
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_reported() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let input = job_bytes("ghost", file.path());
        let mut output = Vec::new();

        let report = run_job(&config(), &catalog(&[]), &connectors(), "ghost", input.as_slice(), &mut output)
            .await
            .unwrap();
        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Error);
        assert!(failure.reason.contains("ghost"));
    }

    #[tokio::test]
    async fn test_mismatched_job_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let input = job_bytes("sizes", file.path());
        let err = run_job(&config(), &catalog(&["sizes"]), &connectors(), "other", input.as_slice(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::PluginMismatch { .. }));

        let err = run_job(&config(), &catalog(&["sizes"]), &connectors(), "sizes", &b"{"[..], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidJob(_)));
    }
}
