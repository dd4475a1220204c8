//! Plugins listing command

use super::registry_helper::builtin_catalog;
use anyhow::{Context as _, Result};
use clap::Args;
use pipeline_core::{Config, PluginCatalog};
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Args)]
pub struct PluginsCommand {
    /// Configuration used to decide which plugins are active
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl PluginsCommand {
    pub async fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => Config::load(path).with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => Config::default(),
        };
        print!("{}", describe_plugins(&config, &builtin_catalog()));
        Ok(())
    }
}

/// Describe every catalog entry without opening any connector
pub fn describe_plugins(config: &Config, catalog: &PluginCatalog) -> String {
    let mut out = String::from("Available plugins:\n");

    for name in catalog.names() {
        let _ = writeln!(out, "\n{name}");
        if !config.is_plugin_active(&name) {
            let _ = writeln!(out, "  Status: not active");
            continue;
        }

        let Some(factory) = catalog.get(&name) else {
            continue;
        };
        let built = config
            .for_plugin(&name)
            .map_err(|e| e.to_string())
            .and_then(|plugin_config| {
                factory(&plugin_config)
                    .map(|plugin| (plugin_config, plugin))
                    .map_err(|e| e.to_string())
            });

        match built {
            Ok((plugin_config, plugin)) => {
                let accepted = &plugin_config.plugin.accepted_mime_types;
                let accepted = if accepted.is_empty() {
                    "*".to_string()
                } else {
                    accepted.join(", ")
                };
                let _ = writeln!(out, "  Status: active");
                let _ = writeln!(out, "  Accepts: {accepted}");
                let _ = writeln!(out, "  Timeout: {}s", plugin_config.plugin.timeout_seconds);
                for resource in plugin.resources() {
                    let _ = writeln!(
                        out,
                        "  Resource: /plugins/{name}/{} ({}) params: [{}]",
                        resource.name,
                        resource.description,
                        resource.params.join(", ")
                    );
                }
            }
            Err(e) => {
                let _ = writeln!(out, "  Status: failed ({e})");
            }
        }
    }

    out
}
