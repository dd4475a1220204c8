//! Redis metadata store: the reference is the key, the value is a JSON document

use async_trait::async_trait;
use pipeline_core::{ConnectorConfig, ConnectorError, MetaStore};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RedisOptions {
    /// Full connection URL; wins over host/port/db
    url: Option<String>,
    host: String,
    port: u16,
    db: i64,
    password: Option<String>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisOptions {
    fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Connects on first lookup and reuses the multiplexed connection afterwards
pub struct RedisMetaStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisMetaStore {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: RedisOptions = config.options()?;
        let client = redis::Client::open(options.url()).map_err(|e| ConnectorError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, ConnectorError> {
        self.connection
            .get_or_try_init(|| async {
                debug!("Connecting to redis");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| ConnectorError::Connection(e.to_string()))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl MetaStore for RedisMetaStore {
    async fn fetch_metadata(&self, reference: &str) -> Result<Vec<u8>, ConnectorError> {
        let mut connection = self.connection().await?;
        let value: Option<Vec<u8>> = connection
            .get(reference)
            .await
            .map_err(|e| ConnectorError::Query(e.to_string()))?;
        match value {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(ConnectorError::NotFound(format!("redis key {reference}"))),
        }
    }
}
