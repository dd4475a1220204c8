//! Plugin wrapper for size statistics

use crate::{SizeReport, PLUGIN_NAME};
use async_trait::async_trait;
use pipeline_common::{Message, Metadata};
use pipeline_core::{Config, Content, Database, Params, Plugin, PluginError, Resource};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../sql/schema.sql");
const INSERT: &str = include_str!("../sql/insert.sql");
const BY_UUID: &str = include_str!("../sql/by_uuid.sql");
const SMALLER_THAN: &str = include_str!("../sql/smaller_than.sql");
const LARGER_THAN: &str = include_str!("../sql/larger_than.sql");

/// Records metadata entry count and payload size per message
#[derive(Default)]
pub struct SizesPlugin {
    schema: OnceCell<()>,
}

impl SizesPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_schema(&self, database: &dyn Database) -> Result<(), PluginError> {
        self.schema
            .get_or_try_init(|| async {
                debug!("Creating sizes table");
                database.execute_query(SCHEMA, &Params::new()).await.map(|_| ())
            })
            .await?;
        Ok(())
    }
}

/// Row parameters for one measured message
fn insert_params(message: &Message, report: &SizeReport) -> Result<Params, PluginError> {
    Ok(Params::from_iter([
        ("uuid".to_string(), Value::from(message.uuid.clone())),
        ("meta_location".to_string(), Value::from(message.meta_location.clone())),
        ("data_location".to_string(), Value::from(message.data_location.clone())),
        ("metadata_size".to_string(), Value::from(report.metadata_size)),
        ("data_size".to_string(), Value::from(report.data_size_i64()?)),
    ]))
}

#[async_trait]
impl Plugin for SizesPlugin {
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
        info!("Getting metadata count and payload size for {}", message.label());
        let report = SizeReport::measure(&metadata, &mut content).await?;
        debug!(
            "{}: {} metadata entries, {} bytes",
            message.label(),
            report.metadata_size,
            report.data_size
        );

        self.ensure_schema(database).await?;
        database.execute_query(INSERT, &insert_params(&message, &report)?).await?;
        Ok(())
    }

    fn resources(&self) -> Vec<Resource> {
        vec![
            Resource::new("by-uuid", "Sizes recorded for a message uuid", BY_UUID, &["uuid"]),
            Resource::new(
                "smaller-than",
                "Messages whose payload is smaller than data_size bytes",
                SMALLER_THAN,
                &["data_size"],
            ),
            Resource::new(
                "larger-than",
                "Messages whose payload is larger than data_size bytes",
                LARGER_THAN,
                &["data_size"],
            ),
        ]
    }
}
