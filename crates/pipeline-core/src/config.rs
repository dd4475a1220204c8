//! Configuration loading and plugin-local merging

use crate::connector::ConnectorConfig;
use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable restricting discovery to a single plugin
pub const SINGLE_PLUGIN_ENV: &str = "PLUGIN";

/// Default per-plugin timeout in seconds
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Sections whose list values are extended rather than replaced on merge
const EXTENDED_SECTIONS: &[&str] = &["active_plugins"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: ConnectorConfig,
    pub message: MessageConfig,
    pub data_store: ConnectorConfig,
    pub meta_store: Option<ConnectorConfig>,
    pub database: ConnectorConfig,
    pub plugin: PluginSettings,
    pub active_plugins: Vec<String>,
    pub processing: ProcessingConfig,
    pub api: ApiConfig,
    pub plugins_dir: Option<PathBuf>,
    pub custom: Mapping,

    /// Value of `PLUGIN` captured by [`Config::load`]
    #[serde(skip)]
    pub single_plugin: Option<String>,

    #[serde(skip)]
    raw: Mapping,
}

/// Wire format of broker payloads and field mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// `json`, `string` or `str`
    pub parser: String,
    /// Ordered field names for the string parser, joined by `delimiter`
    pub format: Option<String>,
    pub delimiter: String,
    pub message_fields: Option<BTreeMap<String, FieldSpec>>,
    pub mime: Option<MimeConfig>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            parser: "json".to_string(),
            format: None,
            delimiter: ",".to_string(),
            message_fields: None,
            mime: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Location of a declared mime type inside the metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimeConfig {
    pub path: String,
    #[serde(default = "default_path_separator")]
    pub path_separator: String,
}

fn default_path_separator() -> String {
    ".".to_string()
}

/// The `plugin` section, usually provided by the plugin-local file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default, alias = "mime_types", alias = "supported_mime")]
    pub accepted_mime_types: Vec<String>,

    #[serde(default = "default_timeout_seconds", alias = "timeout")]
    pub timeout_seconds: u64,

    /// Plugin specific options
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            accepted_mime_types: Vec::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            options: BTreeMap::new(),
        }
    }
}

impl PluginSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Deserialize plugin specific options, ignoring unknown keys
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let mapping: Mapping = self
            .options
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect();
        Ok(serde_yaml::from_value(Value::Mapping(mapping))?)
    }
}

/// How plugin invocations are isolated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One worker process per plugin invocation
    #[default]
    Process,
    /// A tokio task per plugin invocation
    Task,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub isolation: Isolation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Delivery policy shared by every broker kind
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerPolicy {
    /// Seconds between connectivity attempts and reconnects
    pub retry_interval: u64,
    /// Seconds to wait before processing each delivery
    pub process_delay: u64,
    /// Requeue messages that failed permanently
    pub requeue: bool,
    pub dead_letter_exchange: String,
    pub prefetch: u16,
}

impl Default for BrokerPolicy {
    fn default() -> Self {
        Self {
            retry_interval: 3,
            process_delay: 0,
            requeue: false,
            dead_letter_exchange: "dlx".to_string(),
            prefetch: 10,
        }
    }
}

impl BrokerPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn process_delay(&self) -> Duration {
        Duration::from_secs(self.process_delay)
    }
}

impl Config {
    /// Load a configuration file and capture the single-plugin override
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration: {}", path.display());

        let mut config = Self::from_mapping(read_mapping(path)?)?;
        config.single_plugin = std::env::var(SINGLE_PLUGIN_ENV)
            .ok()
            .filter(|name| !name.is_empty());
        Ok(config)
    }

    /// Parse YAML text with `$VAR` / `${VAR}` expansion
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_mapping(parse_mapping(text)?)
    }

    fn from_mapping(raw: Mapping) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_value(Value::Mapping(raw.clone()))?;
        if config
            .meta_store
            .as_ref()
            .is_some_and(|store| store.kind.is_none() && store.options.is_empty())
        {
            config.meta_store = None;
        }
        config.raw = raw;
        config.validate()?;
        Ok(config)
    }

    pub fn with_single_plugin(mut self, name: Option<String>) -> Self {
        self.single_plugin = name;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "plugin.timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.message.delimiter.is_empty() {
            return Err(ConfigError::Invalid("message.delimiter must not be empty".to_string()));
        }
        Ok(())
    }

    /// Plugin-local configuration file, if one exists
    pub fn plugin_config_path(&self, plugin: &str) -> Option<PathBuf> {
        let dir = self.plugins_dir.as_ref()?;
        [dir.join(plugin).join("config.yaml"), dir.join(format!("{plugin}.yaml"))]
            .into_iter()
            .find(|candidate| candidate.is_file())
    }

    /// Global configuration merged with the plugin-local file
    pub fn for_plugin(&self, plugin: &str) -> Result<Config, ConfigError> {
        let Some(path) = self.plugin_config_path(plugin) else {
            debug!("No plugin-local configuration for {}", plugin);
            return Ok(self.clone());
        };

        debug!("Merging plugin configuration: {}", path.display());
        let mut raw = self.raw.clone();
        merge_sections(&mut raw, read_mapping(&path)?);

        let mut merged = Self::from_mapping(raw)?;
        merged.single_plugin = self.single_plugin.clone();
        Ok(merged)
    }

    pub fn broker_policy(&self) -> Result<BrokerPolicy, ConfigError> {
        self.broker
            .options::<BrokerPolicy>()
            .map_err(|e| ConfigError::Invalid(format!("broker: {e}")))
    }

    /// Whether a plugin passes the allow-list and single-plugin override
    pub fn is_plugin_active(&self, plugin: &str) -> bool {
        if let Some(single) = &self.single_plugin {
            return single == plugin;
        }
        self.active_plugins.is_empty() || self.active_plugins.iter().any(|p| p == plugin)
    }
}

fn read_mapping(path: &Path) -> Result<Mapping, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_mapping(&text)
}

fn parse_mapping(text: &str) -> Result<Mapping, ConfigError> {
    let expanded = shellexpand::env_with_context_no_errors(text, |var| std::env::var(var).ok());
    match serde_yaml::from_str::<Value>(&expanded)? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        other => Err(ConfigError::Invalid(format!(
            "expected a mapping at the top level, got {other:?}"
        ))),
    }
}

/// Section-wise shallow merge of `overrides` into `base`
fn merge_sections(base: &mut Mapping, overrides: Mapping) {
    for (key, value) in overrides {
        let extend = key.as_str().is_some_and(|k| EXTENDED_SECTIONS.contains(&k));
        match (base.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(update)) => {
                for (k, v) in update {
                    existing.insert(k, v);
                }
            }
            (Some(Value::Sequence(existing)), Value::Sequence(update)) if extend => {
                existing.extend(update);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
