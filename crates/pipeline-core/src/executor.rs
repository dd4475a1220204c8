//! Plugin executors: isolated invocation with a per-plugin timeout

use crate::error::PluginError;
use crate::plugin::Content;
use crate::registry::PluginDescriptor;
use async_trait::async_trait;
use pipeline_common::{FailureKind, Message, Metadata, PluginFailure};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Inputs of one plugin invocation; cloned for every plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginJob {
    pub message: Message,
    pub metadata: Metadata,
    pub content_path: PathBuf,
}

/// Job sent to a worker process on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub plugin: String,
    #[serde(flatten)]
    pub job: PluginJob,
}

/// Single JSON line a worker prints on stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub plugin: String,
    pub failure: Option<PluginFailure>,
}

#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, descriptor: &PluginDescriptor, job: PluginJob) -> Result<(), PluginFailure>;
}

fn timeout_failure(name: &str, message: &Message, timeout: Duration) -> PluginFailure {
    PluginFailure::new(
        name,
        FailureKind::Timeout,
        format!(
            "{} in {}, used more execution time than threshold ({}s)",
            message.label(),
            name,
            timeout.as_secs_f64()
        ),
    )
}

fn log_run_time(name: &str, message: &Message, start: Instant) {
    info!(
        "{} used {:.1} (milliseconds) processing {}",
        name,
        start.elapsed().as_secs_f64() * 1000.0,
        message.label()
    );
}

/// Runs the plugin on a tokio task in this process
///
/// Panics and timeouts are captured, but a plugin that blocks the thread or
/// aborts the process is not contained. Used by workers and in tests.
///
/// Every invocation uses the descriptor's database handle, so concurrent
/// messages share one connection per plugin. Database connectors must accept
/// concurrent queries on one handle; `ProcessExecutor` opens one per invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskExecutor;

#[async_trait]
impl PluginExecutor for TaskExecutor {
    async fn execute(&self, descriptor: &PluginDescriptor, job: PluginJob) -> Result<(), PluginFailure> {
        let name = descriptor.name.clone();
        let timeout = descriptor.timeout();
        let label_message = job.message.clone();
        info!("{} started processing on {}", name, label_message.label());
        let start = Instant::now();

        let plugin = descriptor.plugin.clone();
        let config = descriptor.config.clone();
        let database = descriptor.database.clone();
        let mut handle = tokio::spawn(async move {
            let content = Content::open(&job.content_path).await?;
            plugin
                .execute(&config, database.as_ref(), job.message, job.metadata, content)
                .await?;
            Ok::<(), PluginError>(())
        });

        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                handle.abort();
                Err(timeout_failure(&name, &label_message, timeout))
            }
            Ok(Err(join_error)) if join_error.is_panic() => Err(PluginFailure::new(
                &name,
                FailureKind::Panic,
                format!("plugin panicked: {join_error}"),
            )),
            Ok(Err(join_error)) => Err(PluginFailure::new(&name, FailureKind::Crash, join_error.to_string())),
            Ok(Ok(Err(e))) => Err(PluginFailure::new(&name, FailureKind::Error, e.to_string())),
            Ok(Ok(Ok(()))) => Ok(()),
        };

        if let Err(failure) = &outcome {
            warn!("{} failed processing {}: {}", name, label_message.label(), failure.reason);
        }
        log_run_time(&name, &label_message, start);
        outcome
    }
}

/// Runs each invocation in a separate worker process
///
/// The worker is the given program with `args` followed by
/// `--plugin <name>`. It reads a [`WorkerJob`] from stdin and answers with a
/// [`WorkerReport`] line on stdout. The child is killed when the timeout
/// expires.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute the running binary
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<OsString>>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    async fn run_worker(&self, payload: Vec<u8>, name: &str) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--plugin")
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        debug!("Spawned worker {:?} for {}", child.id(), name);

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    }
}

/// Last stdout line that parses as a report
fn parse_report(stdout: &[u8]) -> Option<WorkerReport> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<WorkerReport>(line.trim()).ok())
}

#[async_trait]
impl PluginExecutor for ProcessExecutor {
    async fn execute(&self, descriptor: &PluginDescriptor, job: PluginJob) -> Result<(), PluginFailure> {
        let name = descriptor.name.as_str();
        let timeout = descriptor.timeout();
        let message = job.message.clone();
        info!("{} started processing on {} in a worker process", name, message.label());
        let start = Instant::now();

        let worker_job = WorkerJob {
            plugin: name.to_string(),
            job,
        };
        let payload = serde_json::to_vec(&worker_job)
            .map_err(|e| PluginFailure::new(name, FailureKind::Error, format!("could not encode job: {e}")))?;

        let outcome = match tokio::time::timeout(timeout, self.run_worker(payload, name)).await {
            Err(_) => Err(timeout_failure(name, &message, timeout)),
            Ok(Err(e)) => Err(PluginFailure::new(
                name,
                FailureKind::Crash,
                format!("could not run worker: {e}"),
            )),
            Ok(Ok(output)) => match parse_report(&output.stdout) {
                Some(WorkerReport { failure: None, .. }) => Ok(()),
                Some(WorkerReport {
                    failure: Some(failure),
                    ..
                }) => Err(failure),
                None => Err(PluginFailure::new(
                    name,
                    FailureKind::Crash,
                    format!("worker exited with {} without a report", output.status),
                )),
            },
        };

        if let Err(failure) = &outcome {
            warn!("{} failed processing {}: {}", name, message.label(), failure.reason);
        }
        log_run_time(name, &message, start);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connector::Database;
    use crate::plugin::Plugin;
    use crate::registry::tests::CountingDatabase;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    enum Behaviour {
        Ok,
        Fail,
        Panic,
        Sleep(Duration),
        Touch,
    }

    struct TestPlugin(Behaviour);

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            "test"
        }

        async fn execute(
            &self,
            _config: &Config,
            database: &dyn Database,
            _message: Message,
            _metadata: Metadata,
            mut content: Content,
        ) -> Result<(), PluginError> {
            let mut text = String::new();
            content.read_to_string(&mut text).await?;
            match &self.0 {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(PluginError::ExecutionFailed(format!("rejected {text}"))),
                Behaviour::Panic => panic!("plugin bug"),
                Behaviour::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(())
                }
                Behaviour::Touch => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    database.initialize().await?;
                    Ok(())
                }
            }
        }
    }

    fn descriptor(behaviour: Behaviour, timeout_seconds: u64) -> PluginDescriptor {
        let mut config = Config::default();
        config.plugin.timeout_seconds = timeout_seconds;
        PluginDescriptor {
            name: "test".to_string(),
            config: Arc::new(config),
            database: Arc::new(CountingDatabase::default()),
            plugin: Arc::new(TestPlugin(behaviour)),
        }
    }

    fn job(file: &tempfile::NamedTempFile) -> PluginJob {
        PluginJob {
            message: Message::new(file.path().display().to_string()),
            metadata: Metadata::new(),
            content_path: file.path().to_path_buf(),
        }
    }

    fn content_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file
    }

    #[tokio::test]
    async fn test_task_success() {
        let file = content_file();
        assert!(TaskExecutor.execute(&descriptor(Behaviour::Ok, 5), job(&file)).await.is_ok());
    }

    #[tokio::test]
    async fn test_task_error_is_captured() {
        let file = content_file();
        let failure = TaskExecutor
            .execute(&descriptor(Behaviour::Fail, 5), job(&file))
            .await
            .unwrap_err();
        assert_eq!(failure.plugin, "test");
        assert_eq!(failure.kind, FailureKind::Error);
        assert!(failure.reason.contains("rejected abc"));
    }

    #[tokio::test]
    async fn test_task_panic_is_captured() {
        let file = content_file();
        let failure = TaskExecutor
            .execute(&descriptor(Behaviour::Panic, 5), job(&file))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panic);
    }

    #[tokio::test]
    async fn test_task_timeout_is_bounded() {
        let file = content_file();
        let start = Instant::now();
        let failure = TaskExecutor
            .execute(&descriptor(Behaviour::Sleep(Duration::from_secs(60)), 1), job(&file))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.reason.contains("threshold"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_task_concurrent_jobs_share_the_database_handle() {
        let file = content_file();
        let database = Arc::new(CountingDatabase::default());
        let mut shared = descriptor(Behaviour::Touch, 5);
        shared.database = database.clone();

        let (first, second) = tokio::join!(
            TaskExecutor.execute(&shared, job(&file)),
            TaskExecutor.execute(&shared, job(&file))
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(database.initialized.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_task_missing_content() {
        let mut descriptor_job = job(&content_file());
        descriptor_job.content_path = PathBuf::from("/nonexistent/content");
        let failure = TaskExecutor
            .execute(&descriptor(Behaviour::Ok, 5), descriptor_job)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Error);
    }

    #[test]
    fn test_parse_report_takes_last_json_line() {
        let report = WorkerReport {
            plugin: "test".to_string(),
            failure: Some(PluginFailure::new("test", FailureKind::Error, "boom")),
        };
        let mut stdout = b"noise from a library\n".to_vec();
        stdout.extend(serde_json::to_vec(&report).unwrap());
        stdout.push(b'\n');
        assert_eq!(parse_report(&stdout), Some(report));
        assert_eq!(parse_report(b"nothing useful"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_without_report_is_a_crash() {
        let file = content_file();
        let executor = ProcessExecutor::new("/bin/sh", ["-c", "cat > /dev/null; exit 3", "worker"]);
        let failure = executor
            .execute(&descriptor(Behaviour::Ok, 5), job(&file))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Crash);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_report_is_used() {
        let file = content_file();
        let script = r#"cat > /dev/null; echo '{"plugin":"test","failure":null}'"#;
        let executor = ProcessExecutor::new("/bin/sh", ["-c", script, "worker"]);
        assert!(executor.execute(&descriptor(Behaviour::Ok, 5), job(&file)).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_timeout_kills_worker() {
        let file = content_file();
        let executor = ProcessExecutor::new("/bin/sh", ["-c", "sleep 30", "worker"]);
        let start = Instant::now();
        let failure = executor
            .execute(&descriptor(Behaviour::Ok, 1), job(&file))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
