//! Validate a configuration without connecting to anything

use super::registry_helper::{builtin_catalog, builtin_connectors};
use anyhow::{bail, Context as _, Result};
use clap::Args;
use pipeline_core::connector::{DEFAULT_BROKER, DEFAULT_DATABASE, DEFAULT_DATA_STORE, DEFAULT_META_STORE};
use pipeline_core::{Config, ConnectorRegistry, ConnectorRole, Isolation, MessageDecoder, PluginCatalog};
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckConfigCommand {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,
}

impl CheckConfigCommand {
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(&self.config)
            .with_context(|| format!("Failed to load configuration {}", self.config.display()))?;

        let problems = check_config(&config, &builtin_catalog(), &builtin_connectors());
        if !problems.is_empty() {
            bail!("{} is invalid:\n  {}", self.config.display(), problems.join("\n  "));
        }
        println!("{}: OK", self.config.display());
        Ok(())
    }
}

/// Every problem that would stop the pipeline or one of its plugins from starting
pub fn check_config(config: &Config, catalog: &PluginCatalog, connectors: &ConnectorRegistry) -> Vec<String> {
    let mut problems = Vec::new();

    if let Err(e) = MessageDecoder::new(&config.message) {
        problems.push(format!("message: {e}"));
    }
    if let Err(e) = config.broker_policy() {
        problems.push(e.to_string());
    }

    let mut sections = vec![
        (ConnectorRole::Broker, config.broker.kind_or(DEFAULT_BROKER)),
        (ConnectorRole::DataStore, config.data_store.kind_or(DEFAULT_DATA_STORE)),
        (ConnectorRole::Database, config.database.kind_or(DEFAULT_DATABASE)),
    ];
    if let Some(meta_store) = &config.meta_store {
        sections.push((ConnectorRole::MetaStore, meta_store.kind_or(DEFAULT_META_STORE)));
    }
    for (role, kind) in sections {
        if !connectors.supports(role, kind) {
            problems.push(format!(
                "{role}: unsupported type {kind:?}, available: {}",
                connectors.kinds(role).join(", ")
            ));
        }
    }

    for name in catalog.names() {
        if !config.is_plugin_active(&name) {
            continue;
        }
        let Some(factory) = catalog.get(&name) else {
            continue;
        };
        match config.for_plugin(&name) {
            Ok(plugin_config) => {
                if let Err(e) = factory(&plugin_config) {
                    problems.push(format!("plugin {name}: {e}"));
                }
                if config.processing.isolation == Isolation::Process
                    && plugin_config.database.kind_or(DEFAULT_DATABASE) == "memory"
                {
                    problems.push(format!(
                        "plugin {name}: the memory database is private to each worker process, use isolation: task"
                    ));
                }
            }
            Err(e) => problems.push(format!("plugin {name}: {e}")),
        }
    }

    problems
}
