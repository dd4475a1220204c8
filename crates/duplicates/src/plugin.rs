//! Duplicate detection plugin

use crate::{DuplicatesConfig, HashResolver, PLUGIN_NAME};
use async_trait::async_trait;
use pipeline_common::{Message, Metadata};
use pipeline_core::{Config, Content, Database, Params, Plugin, PluginError, Resource};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../sql/schema.sql");
const INSERT: &str = include_str!("../sql/insert.sql");
const BY_HASH: &str = include_str!("../sql/by_hash.sql");
const BY_UUID: &str = include_str!("../sql/by_uuid.sql");

pub struct DuplicatesPlugin {
    resolver: HashResolver,
    schema: OnceCell<()>,
}

impl DuplicatesPlugin {
    pub fn new(config: DuplicatesConfig) -> Self {
        Self {
            resolver: HashResolver::new(config),
            schema: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self, database: &dyn Database) -> Result<(), PluginError> {
        self.schema
            .get_or_try_init(|| async { database.execute_query(SCHEMA, &Params::new()).await.map(|_| ()) })
            .await?;
        Ok(())
    }
}

impl Default for DuplicatesPlugin {
    fn default() -> Self {
        Self::new(DuplicatesConfig::default())
    }
}

#[async_trait]
impl Plugin for DuplicatesPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn execute(
        &self,
        _config: &Config,
        database: &dyn Database,
        message: Message,
        metadata: Metadata,
        mut content: Content,
    ) -> Result<(), PluginError> {
        let (sha_256, source) = self.resolver.resolve(&message, &metadata, &mut content).await?;
        debug!("{}: sha-256 {} taken from {:?}", message.label(), sha_256, source);

        info!("Storing hash of {} in database", message.label());
        self.ensure_schema(database).await?;
        let params = Params::from_iter([
            ("uuid".to_string(), Value::from(message.uuid)),
            ("meta_location".to_string(), Value::from(message.meta_location)),
            ("data_location".to_string(), Value::from(message.data_location)),
            ("sha_256".to_string(), Value::from(sha_256)),
        ]);
        database.execute_query(INSERT, &params).await?;
        Ok(())
    }

    fn resources(&self) -> Vec<Resource> {
        vec![
            Resource::new("by-hash", "Messages whose payload has the given SHA-256", BY_HASH, &["sha_256"]),
            Resource::new(
                "by-uuid",
                "Other messages with the same payload as the given uuid",
                BY_UUID,
                &["uuid"],
            ),
        ]
    }
}
