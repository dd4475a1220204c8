//! Plugin discovery and the active/failed/unloaded partition

use crate::config::Config;
use crate::connector::{ConnectorRegistry, Database};
use crate::error::RegistryError;
use crate::fileinfo::{plugin_accepts, AcceptedTypes};
use crate::plugin::{Plugin, PluginCatalog, Resource};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One initialized plugin with its merged configuration and private database
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub config: Arc<Config>,
    pub database: Arc<dyn Database>,
    pub plugin: Arc<dyn Plugin>,
}

impl PluginDescriptor {
    pub fn accepted_mime_types(&self) -> &[String] {
        &self.config.plugin.accepted_mime_types
    }

    pub fn timeout(&self) -> Duration {
        self.config.plugin.timeout()
    }

    pub fn accepts(&self, mime: &str) -> bool {
        plugin_accepts(self.accepted_mime_types(), mime)
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.plugin.resources()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("accepted_mime_types", &self.accepted_mime_types())
            .field("timeout", &self.timeout())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPlugin {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnloadedPlugin {
    pub name: String,
}

/// Plugin counts and names for the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub discovered: usize,
    pub registered: Vec<String>,
    pub failed: Vec<FailedPlugin>,
    pub unloaded: Vec<UnloadedPlugin>,
}

/// Plugin registry, built once at startup and read-only afterwards
#[derive(Debug, Default)]
pub struct PluginRegistry {
    discovered: usize,
    active: Vec<PluginDescriptor>,
    failed: Vec<FailedPlugin>,
    unloaded: Vec<UnloadedPlugin>,
    accepted: AcceptedTypes,
}

impl PluginRegistry {
    /// Initialize every catalog entry allowed by the configuration
    ///
    /// A plugin that fails to initialize is recorded and skipped; it never
    /// prevents the remaining plugins from loading.
    pub async fn discover(config: &Config, catalog: &PluginCatalog, connectors: &ConnectorRegistry) -> Self {
        debug!("Searching for available and active plugins");
        let names = catalog.names();
        let mut registry = Self {
            discovered: names.len(),
            ..Default::default()
        };

        for name in names {
            if !config.is_plugin_active(&name) {
                debug!("Plugin {} is not listed as active", name);
                registry.unloaded.push(UnloadedPlugin { name });
                continue;
            }

            debug!("Registering plugin {}", name);
            match Self::load_plugin(config, catalog, connectors, &name, true).await {
                Ok(descriptor) => {
                    info!(
                        "Registered plugin {} (accepts {:?}, timeout {:?})",
                        name,
                        descriptor.accepted_mime_types(),
                        descriptor.timeout()
                    );
                    registry.active.push(descriptor);
                }
                Err(e) => {
                    let error = format!("Could not register plugin {name}: {e}");
                    warn!("{}", error);
                    registry.failed.push(FailedPlugin { name, error });
                }
            }
        }

        registry.accepted =
            AcceptedTypes::from_plugins(registry.active.iter().map(PluginDescriptor::accepted_mime_types));

        let total = registry.discovered;
        info!("{}/{} registered plugins", registry.active.len(), total);
        info!("{}/{} unloaded plugins", registry.unloaded.len(), total);
        info!("{}/{} failed plugins", registry.failed.len(), total);
        debug!("Accepted mime types: {:?}", registry.accepted);
        registry
    }

    /// Build one plugin: merge its configuration, create it, open its database
    ///
    /// `initialize` runs the database init script; workers skip it since the
    /// parent already ran it at startup.
    pub async fn load_plugin(
        config: &Config,
        catalog: &PluginCatalog,
        connectors: &ConnectorRegistry,
        name: &str,
        initialize: bool,
    ) -> Result<PluginDescriptor, RegistryError> {
        let factory = catalog
            .get(name)
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))?;

        let merged = Arc::new(config.for_plugin(name)?);
        let plugin = factory(&merged)?;
        let database = connectors.database(&merged.database).await?;
        if initialize {
            database.initialize().await?;
        }

        Ok(PluginDescriptor {
            name: name.to_string(),
            config: merged,
            database,
            plugin,
        })
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.active
    }

    pub fn failed(&self) -> &[FailedPlugin] {
        &self.failed
    }

    pub fn unloaded(&self) -> &[UnloadedPlugin] {
        &self.unloaded
    }

    pub fn accepted_types(&self) -> &AcceptedTypes {
        &self.accepted
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.active.iter().find(|d| d.name == name)
    }

    /// Active plugins whose accepted list matches `mime`
    pub fn select(&self, mime: &str) -> Vec<&PluginDescriptor> {
        self.active.iter().filter(|d| d.accepts(mime)).collect()
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            discovered: self.discovered,
            registered: self.active.iter().map(|d| d.name.clone()).collect(),
            failed: self.failed.clone(),
            unloaded: self.unloaded.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connector::{ConnectorConfig, Params, Row};
    use crate::error::{ConnectorError, PluginError};
    use crate::plugin::Content;
    use async_trait::async_trait;
    use pipeline_common::{Message, Metadata};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct NamedPlugin(pub String);

    #[async_trait]
    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            &self.0
        }

        async fn execute(
            &self,
            _config: &Config,
            _database: &dyn Database,
            _message: Message,
            _metadata: Metadata,
            _content: Content,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingDatabase {
        pub initialized: AtomicUsize,
    }

    #[async_trait]
    impl Database for CountingDatabase {
        async fn initialize(&self) -> Result<(), ConnectorError> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_script(&self, _path: &Path, _params: &Params) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn execute_query(&self, _sql: &str, _params: &Params) -> Result<Vec<Row>, ConnectorError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn connectors() -> ConnectorRegistry {
        let mut connectors = ConnectorRegistry::new();
        connectors.register_database("memory", |_config: ConnectorConfig| async move {
            Ok::<_, ConnectorError>(Arc::new(CountingDatabase::default()) as Arc<dyn Database>)
        });
        connectors
    }

    pub(crate) fn catalog(names: &[&str]) -> PluginCatalog {
        let mut catalog = PluginCatalog::new();
        for name in names {
            let owned = name.to_string();
            catalog.register(name, move |_| Ok(Arc::new(NamedPlugin(owned.clone())) as Arc<dyn Plugin>));
        }
        catalog
    }

    fn plugins_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(format!("{name}.yaml")), body).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_discover_partitions_plugins() {
        let dir = plugins_dir(&[
            ("thumbnails", "database:\n  type: sqlite\n"),
            ("sizes", "plugin:\n  accepted_mime_types: [image/jpeg]\n"),
        ]);
        let config = Config::from_yaml_str(&format!(
            "database:\n  type: memory\nactive_plugins: [sizes, thumbnails]\nplugins_dir: {}\n",
            dir.path().display()
        ))
        .unwrap();

        let registry =
            PluginRegistry::discover(&config, &catalog(&["sizes", "duplicates", "thumbnails"]), &connectors()).await;

        assert_eq!(registry.plugins().len(), 1);
        assert_eq!(registry.plugins()[0].name, "sizes");
        assert_eq!(registry.failed().len(), 1);
        assert_eq!(registry.failed()[0].name, "thumbnails");
        assert!(registry.failed()[0].error.contains("sqlite"));
        assert_eq!(registry.unloaded(), &[UnloadedPlugin { name: "duplicates".into() }]);

        let status = registry.status();
        assert_eq!(status.discovered, 3);
        assert_eq!(status.registered, vec!["sizes".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_allow_list_activates_everything() {
        let config = Config::from_yaml_str("database:\n  type: memory\n").unwrap();
        let registry = PluginRegistry::discover(&config, &catalog(&["a", "b"]), &connectors()).await;
        assert_eq!(registry.plugins().len(), 2);
        assert!(registry.accepted_types().is_wildcard());
    }

    #[tokio::test]
    async fn test_single_plugin_override() {
        let config = Config::from_yaml_str("database:\n  type: memory\nactive_plugins: [a]\n")
            .unwrap()
            .with_single_plugin(Some("b".to_string()));
        let registry = PluginRegistry::discover(&config, &catalog(&["a", "b"]), &connectors()).await;
        assert_eq!(registry.plugins().len(), 1);
        assert!(registry.get("b").is_some());
        assert_eq!(registry.unloaded().len(), 1);
    }

    #[tokio::test]
    async fn test_select_by_mime() {
        let dir = plugins_dir(&[
            ("jpeg-only", "plugin:\n  accepted_mime_types: [image/jpeg]\n"),
            ("everything", "plugin:\n  accepted_mime_types: ['*']\n"),
        ]);
        let config = Config::from_yaml_str(&format!(
            "database:\n  type: memory\nplugins_dir: {}\n",
            dir.path().display()
        ))
        .unwrap();
        let registry =
            PluginRegistry::discover(&config, &catalog(&["jpeg-only", "everything"]), &connectors()).await;

        let selected: Vec<&str> = registry.select("image/png").iter().map(|d| d.name.as_str()).collect();
        assert_eq!(selected, vec!["everything"]);
        assert_eq!(registry.select("image/jpeg").len(), 2);
        assert!(registry.accepted_types().accepts("image/png"));
    }

    #[tokio::test]
    async fn test_factory_error_is_recorded() {
        let mut catalog = catalog(&["good"]);
        catalog.register("bad", |_| Err(PluginError::InvalidInput("missing output_dir".into())));
        let config = Config::from_yaml_str("database:\n  type: memory\n").unwrap();

        let registry = PluginRegistry::discover(&config, &catalog, &connectors()).await;
        assert_eq!(registry.plugins().len(), 1);
        assert_eq!(registry.failed().len(), 1);
        assert!(registry.failed()[0].error.contains("missing output_dir"));
    }

    #[tokio::test]
    async fn test_load_unknown_plugin() {
        let err = PluginRegistry::load_plugin(&Config::default(), &catalog(&[]), &connectors(), "ghost", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPlugin(_)));
    }
}
