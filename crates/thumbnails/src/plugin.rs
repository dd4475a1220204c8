//! Plugin wrapper for thumbnail generation

use crate::{Thumbnailer, PLUGIN_NAME};
use async_trait::async_trait;
use pipeline_common::{Message, Metadata};
use pipeline_core::{Config, Content, Database, Params, Plugin, PluginError, Resource};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../sql/schema.sql");
const INSERT: &str = include_str!("../sql/insert.sql");
const BY_UUID: &str = include_str!("../sql/by_uuid.sql");

/// Thumbnail plugin implementation
pub struct ThumbnailPlugin {
    thumbnailer: Thumbnailer,
    schema: OnceCell<()>,
}

impl ThumbnailPlugin {
    pub fn new(thumbnailer: Thumbnailer) -> Self {
        Self {
            thumbnailer,
            schema: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Plugin for ThumbnailPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn execute(
        &self,
        _config: &Config,
        database: &dyn Database,
        message: Message,
        _metadata: Metadata,
        content: Content,
    ) -> Result<(), PluginError> {
        let start = Instant::now();
        let name = message.uuid.as_deref().unwrap_or(&message.id);
        let thumbnail = self.thumbnailer.create(content.path(), name).await?;
        info!(
            "Created {}x{} thumbnail for {} in {:?}",
            thumbnail.width,
            thumbnail.height,
            message.label(),
            start.elapsed()
        );

        self.schema
            .get_or_try_init(|| async { database.execute_query(SCHEMA, &Params::new()).await.map(|_| ()) })
            .await?;

        let params = Params::from_iter([
            ("uuid".to_string(), Value::from(message.uuid.clone())),
            ("meta_location".to_string(), Value::from(message.meta_location.clone())),
            ("data_location".to_string(), Value::from(message.data_location.clone())),
            ("mime_type".to_string(), Value::from(message.mime_type.clone())),
            ("thumb_location".to_string(), Value::from(thumbnail.path.display().to_string())),
            ("width".to_string(), Value::from(thumbnail.width)),
            ("height".to_string(), Value::from(thumbnail.height)),
        ]);
        debug!("Storing thumbnail reference: {:?}", params);
        database.execute_query(INSERT, &params).await?;
        Ok(())
    }

    fn resources(&self) -> Vec<Resource> {
        vec![Resource::new(
            "by-uuid",
            "Thumbnail recorded for a message uuid",
            BY_UUID,
            &["uuid"],
        )]
    }
}
