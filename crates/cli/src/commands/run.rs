//! Run the pipeline: consume messages until a termination signal

use super::registry_helper::{builtin_catalog, builtin_connectors};
use anyhow::{Context as _, Result};
use clap::Args;
use pipeline_api_server::ApiState;
use pipeline_core::{
    Config, ConnectorRegistry, Isolation, PluginCatalog, PluginExecutor, PluginRegistry, ProcessExecutor,
    ProcessingManager, Shutdown, TaskExecutor,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunCommand {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,
}

impl RunCommand {
    pub async fn execute(self) -> Result<()> {
        let config = Arc::new(
            Config::load(&self.config)
                .with_context(|| format!("Failed to load configuration {}", self.config.display()))?,
        );

        let executor: Arc<dyn PluginExecutor> = match config.processing.isolation {
            Isolation::Process => Arc::new(
                ProcessExecutor::current_exe(worker_args(&self.config))
                    .context("Failed to locate the pipeline executable")?,
            ),
            Isolation::Task => Arc::new(TaskExecutor),
        };
        info!("Plugin isolation: {:?}", config.processing.isolation);

        let shutdown = Shutdown::new();
        spawn_signal_handler(shutdown.clone());
        run_pipeline(config, &builtin_catalog(), &builtin_connectors(), executor, shutdown).await
    }
}

/// Arguments that make a re-executed binary act as a worker for this configuration
pub fn worker_args(config: &Path) -> Vec<OsString> {
    let config = std::fs::canonicalize(config).unwrap_or_else(|_| config.to_path_buf());
    vec!["worker".into(), "--config".into(), config.into_os_string()]
}

/// Discover plugins, start the resource manager and process messages until `shutdown` terminates
pub async fn run_pipeline(
    config: Arc<Config>,
    catalog: &PluginCatalog,
    connectors: &ConnectorRegistry,
    executor: Arc<dyn PluginExecutor>,
    shutdown: Shutdown,
) -> Result<()> {
    let registry = Arc::new(PluginRegistry::discover(&config, catalog, connectors).await);
    let manager = Arc::new(
        ProcessingManager::new(config.clone(), connectors, registry.clone(), executor, shutdown.clone())
            .await
            .context("Failed to start the processing manager")?,
    );

    let api_stop = CancellationToken::new();
    let api = if config.api.enabled {
        let addr = format!("{}:{}", config.api.host, config.api.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind the resource manager on {addr}"))?;
        let state = ApiState::new(registry.clone());
        Some(tokio::spawn(pipeline_api_server::serve(listener, state, api_stop.clone())))
    } else {
        None
    };

    let mut pipeline = tokio::spawn(manager.run());
    let finished_early = tokio::select! {
        joined = &mut pipeline => Some(joined),
        _ = shutdown.terminated() => None,
    };
    let joined = match finished_early {
        Some(joined) => {
            warn!("Message subscription ended before shutdown was requested");
            shutdown.request();
            joined
        }
        None => pipeline.await,
    };
    shutdown.terminated().await;

    api_stop.cancel();
    if let Some(api) = api {
        match api.await {
            Ok(Err(e)) => warn!("Resource manager failed: {}", e),
            Err(e) => warn!("Resource manager task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    joined
        .context("Processing task panicked")?
        .context("Message subscription failed")?;
    info!("Pipeline stopped");
    Ok(())
}

/// Request shutdown on SIGINT or SIGTERM
pub fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received termination signal");
        shutdown.request();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
