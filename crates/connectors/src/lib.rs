//! Concrete connectors for the content pipeline
//!
//! Each backend implements one of the connector traits from `pipeline-core`
//! and is registered under its configuration `type`:
//! - **Brokers**: `memory`, `rabbitmq`, `kafka` (cargo feature `kafka`)
//! - **Data stores**: `disk`, `s3`, `http`
//! - **Meta stores**: `disk`, `redis`
//! - **Databases**: `postgres`, `memory`
//!
//! # Example
//!
//! ```rust,no_run
//! use pipeline_connectors::builtin_connectors;
//! use pipeline_core::ConnectorConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connectors = builtin_connectors();
//!     let store = connectors.data_store(&ConnectorConfig::new("disk")).await?;
//!     let content = store.download_to_disk("/data/incoming/photo.jpg").await?;
//!     println!("materialized at {}", content.path().display());
//!     Ok(())
//! }
//! ```

use pipeline_core::{Broker, ConnectorConfig, ConnectorError, ConnectorRegistry, DataStore, Database, MetaStore};
use std::path::Path;
use std::sync::Arc;

pub mod disk;
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod postgres;
pub mod rabbitmq;
pub mod redis_store;
pub mod s3;

pub use disk::{DiskDataStore, DiskMetaStore};
pub use http::HttpDataStore;
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::{MemoryBroker, MemoryDatabase, Settlement};
pub use postgres::PostgresDatabase;
pub use rabbitmq::RabbitMqBroker;
pub use redis_store::RedisMetaStore;
pub use s3::S3DataStore;

/// Register every backend compiled into this crate
pub fn register_builtin_connectors(registry: &mut ConnectorRegistry) {
    registry.register_broker("memory", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(MemoryBroker::from_config(&config)?) as Arc<dyn Broker>)
    });
    registry.register_broker("rabbitmq", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(RabbitMqBroker::from_config(&config)?) as Arc<dyn Broker>)
    });
    #[cfg(feature = "kafka")]
    registry.register_broker("kafka", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(KafkaBroker::from_config(&config)?) as Arc<dyn Broker>)
    });

    registry.register_data_store("disk", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(DiskDataStore::from_config(&config)?) as Arc<dyn DataStore>)
    });
    registry.register_data_store("s3", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(S3DataStore::from_config(&config).await?) as Arc<dyn DataStore>)
    });
    registry.register_data_store("http", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(HttpDataStore::from_config(&config)?) as Arc<dyn DataStore>)
    });

    registry.register_meta_store("disk", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(DiskMetaStore::from_config(&config)?) as Arc<dyn MetaStore>)
    });
    registry.register_meta_store("redis", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(RedisMetaStore::from_config(&config)?) as Arc<dyn MetaStore>)
    });

    registry.register_database("postgres", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(PostgresDatabase::from_config(&config)?) as Arc<dyn Database>)
    });
    registry.register_database("memory", |config: ConnectorConfig| async move {
        Ok::<_, ConnectorError>(Arc::new(MemoryDatabase::from_config(&config)?) as Arc<dyn Database>)
    });
}

/// A registry holding every built-in backend
pub fn builtin_connectors() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    register_builtin_connectors(&mut registry);
    registry
}

/// Temporary file keeping the extension of `reference`, so mime sniffing by extension still works
pub(crate) fn temp_file_for(reference: &str) -> Result<tempfile::NamedTempFile, ConnectorError> {
    let suffix = Path::new(reference)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    Ok(tempfile::Builder::new().prefix("pipeline-").suffix(&suffix).tempfile()?)
}

/// Read an init or query script, distinguishing a missing file
pub(crate) async fn read_script(path: &Path) -> Result<String, ConnectorError> {
    match tokio::fs::read_to_string(path).await {
        Ok(script) => Ok(script),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ConnectorError::NotFound(format!("script {}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}
