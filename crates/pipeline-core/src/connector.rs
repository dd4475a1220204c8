//! Connector contracts and the registry that resolves them
//!
//! A connector is resolved from a role (broker, database, data store or meta
//! store) and the `type` string of its configuration section. Implementations
//! are compiled in and registered once at startup, see
//! `pipeline_connectors::register_builtin_connectors`.

use crate::error::{ConnectorError, ConnectorResolutionError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use pipeline_common::{DeadLetter, LocalContent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_BROKER: &str = "rabbitmq";
pub const DEFAULT_DATA_STORE: &str = "disk";
pub const DEFAULT_META_STORE: &str = "disk";
pub const DEFAULT_DATABASE: &str = "postgres";

/// Named query parameters, bound to `%(name)s` placeholders
pub type Params = Map<String, Value>;

/// One result row keyed by column name
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorRole {
    Broker,
    Database,
    DataStore,
    MetaStore,
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorRole::Broker => "broker",
            ConnectorRole::Database => "database",
            ConnectorRole::DataStore => "data-store",
            ConnectorRole::MetaStore => "meta-store",
        };
        f.write_str(s)
    }
}

/// A connector section: `type` plus backend specific options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(flatten)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl ConnectorConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn kind_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_yaml::Value::as_str)
    }

    /// Deserialize the options into a connector's typed settings
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, ConnectorError> {
        let mapping: serde_yaml::Mapping = self
            .options
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
            .collect();
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .map_err(|e| ConnectorError::InvalidConfig(e.to_string()))
    }
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), ConnectorError>;

    async fn nack(&self, requeue: bool) -> Result<(), ConnectorError>;
}

/// A raw payload handed over by a broker listener
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: Option<String>,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledge>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Receives deliveries from a broker listener
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process and settle a delivery
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> &str;

    async fn test_connectivity(&self) -> bool;

    /// Consume until `stop` is cancelled, reconnecting on transient loss.
    ///
    /// Each delivery is handed to `handler` on its own task.
    async fn start_listener(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        stop: CancellationToken,
    ) -> Result<(), ConnectorError>;

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Materialize the referenced object on local disk
    async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError>;
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn fetch_metadata(&self, reference: &str) -> Result<Vec<u8>, ConnectorError>;
}

/// Plugin private database handle
#[async_trait]
pub trait Database: Send + Sync {
    /// Run the configured init script, if any
    async fn initialize(&self) -> Result<(), ConnectorError>;

    async fn execute_script(&self, path: &Path, params: &Params) -> Result<(), ConnectorError>;

    async fn execute_query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, ConnectorError>;
}

/// A resolved connector of any role
#[derive(Clone)]
pub enum Connector {
    Broker(Arc<dyn Broker>),
    Database(Arc<dyn Database>),
    DataStore(Arc<dyn DataStore>),
    MetaStore(Arc<dyn MetaStore>),
}

impl Connector {
    pub fn role(&self) -> ConnectorRole {
        match self {
            Connector::Broker(_) => ConnectorRole::Broker,
            Connector::Database(_) => ConnectorRole::Database,
            Connector::DataStore(_) => ConnectorRole::DataStore,
            Connector::MetaStore(_) => ConnectorRole::MetaStore,
        }
    }
}

type Factory = Arc<dyn Fn(ConnectorConfig) -> BoxFuture<'static, Result<Connector, ConnectorError>> + Send + Sync>;

/// `(role, kind) -> factory` table
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<(ConnectorRole, String), Factory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert<F, Fut, T>(&mut self, role: ConnectorRole, kind: &str, factory: F, wrap: fn(T) -> Connector)
    where
        F: Fn(ConnectorConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
        T: Send + 'static,
    {
        debug!("Registering {} connector: {}", role, kind);
        let factory: Factory = Arc::new(move |config| {
            let fut = factory(config);
            Box::pin(async move { fut.await.map(wrap) })
        });
        self.factories.insert((role, kind.to_string()), factory);
    }

    pub fn register_broker<F, Fut>(&mut self, kind: &str, factory: F)
    where
        F: Fn(ConnectorConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Broker>, ConnectorError>> + Send + 'static,
    {
        self.insert(ConnectorRole::Broker, kind, factory, Connector::Broker);
    }

    pub fn register_database<F, Fut>(&mut self, kind: &str, factory: F)
    where
        F: Fn(ConnectorConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Database>, ConnectorError>> + Send + 'static,
    {
        self.insert(ConnectorRole::Database, kind, factory, Connector::Database);
    }

    pub fn register_data_store<F, Fut>(&mut self, kind: &str, factory: F)
    where
        F: Fn(ConnectorConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn DataStore>, ConnectorError>> + Send + 'static,
    {
        self.insert(ConnectorRole::DataStore, kind, factory, Connector::DataStore);
    }

    pub fn register_meta_store<F, Fut>(&mut self, kind: &str, factory: F)
    where
        F: Fn(ConnectorConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn MetaStore>, ConnectorError>> + Send + 'static,
    {
        self.insert(ConnectorRole::MetaStore, kind, factory, Connector::MetaStore);
    }

    pub fn supports(&self, role: ConnectorRole, kind: &str) -> bool {
        self.factories.contains_key(&(role, kind.to_string()))
    }

    /// Registered kinds for a role, sorted
    pub fn kinds(&self, role: ConnectorRole) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .keys()
            .filter(|(r, _)| *r == role)
            .map(|(_, kind)| kind.clone())
            .collect();
        kinds.sort();
        kinds
    }

    /// Resolve and construct a connector
    pub async fn resolve(
        &self,
        role: ConnectorRole,
        kind: &str,
        config: &ConnectorConfig,
    ) -> Result<Connector, ConnectorResolutionError> {
        let factory = self
            .factories
            .get(&(role, kind.to_string()))
            .ok_or_else(|| ConnectorResolutionError::UnsupportedConnector {
                role,
                kind: kind.to_string(),
            })?;

        debug!("Resolving {} connector: {}", role, kind);
        factory(config.clone())
            .await
            .map_err(|source| ConnectorResolutionError::Construction {
                role,
                kind: kind.to_string(),
                source,
            })
    }

    pub async fn broker(&self, config: &ConnectorConfig) -> Result<Arc<dyn Broker>, ConnectorResolutionError> {
        match self
            .resolve(ConnectorRole::Broker, config.kind_or(DEFAULT_BROKER), config)
            .await?
        {
            Connector::Broker(broker) => Ok(broker),
            other => Err(mismatch(ConnectorRole::Broker, config, other)),
        }
    }

    pub async fn database(&self, config: &ConnectorConfig) -> Result<Arc<dyn Database>, ConnectorResolutionError> {
        match self
            .resolve(ConnectorRole::Database, config.kind_or(DEFAULT_DATABASE), config)
            .await?
        {
            Connector::Database(database) => Ok(database),
            other => Err(mismatch(ConnectorRole::Database, config, other)),
        }
    }

    pub async fn data_store(&self, config: &ConnectorConfig) -> Result<Arc<dyn DataStore>, ConnectorResolutionError> {
        match self
            .resolve(ConnectorRole::DataStore, config.kind_or(DEFAULT_DATA_STORE), config)
            .await?
        {
            Connector::DataStore(store) => Ok(store),
            other => Err(mismatch(ConnectorRole::DataStore, config, other)),
        }
    }

    pub async fn meta_store(&self, config: &ConnectorConfig) -> Result<Arc<dyn MetaStore>, ConnectorResolutionError> {
        match self
            .resolve(ConnectorRole::MetaStore, config.kind_or(DEFAULT_META_STORE), config)
            .await?
        {
            Connector::MetaStore(store) => Ok(store),
            other => Err(mismatch(ConnectorRole::MetaStore, config, other)),
        }
    }
}

fn mismatch(role: ConnectorRole, config: &ConnectorConfig, got: Connector) -> ConnectorResolutionError {
    ConnectorResolutionError::Construction {
        role,
        kind: config.kind.clone().unwrap_or_default(),
        source: ConnectorError::InvalidConfig(format!("factory produced a {} connector", got.role())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStore;

    #[async_trait]
    impl MetaStore for NullStore {
        async fn fetch_metadata(&self, reference: &str) -> Result<Vec<u8>, ConnectorError> {
            Err(ConnectorError::NotFound(reference.to_string()))
        }
    }

    #[derive(Debug, Deserialize)]
    struct NullOptions {
        #[serde(default)]
        prefix: Option<String>,
    }

    fn registry() -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register_meta_store("null", |config: ConnectorConfig| async move {
            let _options: NullOptions = config.options()?;
            Ok::<_, ConnectorError>(Arc::new(NullStore) as Arc<dyn MetaStore>)
        });
        registry
    }

    #[tokio::test]
    async fn test_resolve_registered_kind() {
        let registry = registry();
        let config = ConnectorConfig::new("null").with_option("prefix", "meta/");
        let store = registry.meta_store(&config).await.unwrap();
        let err = store.fetch_metadata("u1").await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_unsupported() {
        let registry = registry();
        let config = ConnectorConfig::new("swift");
        let err = registry.meta_store(&config).await.err().unwrap();
        match err {
            ConnectorResolutionError::UnsupportedConnector { role, kind } => {
                assert_eq!(role, ConnectorRole::MetaStore);
                assert_eq!(kind, "swift");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_role_is_part_of_the_key() {
        let registry = registry();
        let err = registry
            .resolve(ConnectorRole::DataStore, "null", &ConnectorConfig::new("null"))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConnectorResolutionError::UnsupportedConnector { role: ConnectorRole::DataStore, .. }
        ));
        assert_eq!(registry.kinds(ConnectorRole::MetaStore), vec!["null".to_string()]);
    }

    #[test]
    fn test_connector_config_yaml() {
        let config: ConnectorConfig = serde_yaml::from_str("type: redis\nhost: localhost\nport: 6379\n").unwrap();
        assert_eq!(config.kind.as_deref(), Some("redis"));
        assert_eq!(config.get_str("host"), Some("localhost"));
        assert_eq!(config.kind_or("disk"), "redis");
        assert_eq!(ConnectorConfig::default().kind_or("disk"), "disk");
    }
}
