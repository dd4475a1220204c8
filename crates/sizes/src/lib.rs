//! Size statistics plugin
//!
//! Counts the top-level metadata entries and the payload bytes of every
//! message and stores one row per message in the `sizes` table.
//!
//! # Resources
//! - `by-uuid`: the row recorded for a message uuid
//! - `smaller-than` / `larger-than`: rows by payload size in bytes
//!
//! # Example
//! ```no_run
//! use pipeline_core::PluginCatalog;
//!
//! let mut catalog = PluginCatalog::new();
//! pipeline_sizes::register(&mut catalog);
//! assert_eq!(catalog.names(), vec!["sizes".to_string()]);
//! ```

pub mod plugin;

pub use plugin::SizesPlugin;

use pipeline_common::Metadata;
use pipeline_core::{Plugin, PluginCatalog, PluginError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Catalog name of the plugin
pub const PLUGIN_NAME: &str = "sizes";

#[derive(Debug, Error)]
pub enum SizesError {
    #[error("Failed to read payload: {0}")]
    Read(#[from] std::io::Error),
    #[error("Payload size {0} does not fit a database integer")]
    TooLarge(u64),
}

impl From<SizesError> for PluginError {
    fn from(err: SizesError) -> Self {
        match err {
            SizesError::Read(e) => PluginError::Io(e),
            other => PluginError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Measured sizes of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    /// Number of top-level metadata entries
    pub metadata_size: usize,
    /// Payload length in bytes
    pub data_size: u64,
}

impl SizeReport {
    /// Count the metadata entries and drain the payload to measure it
    pub async fn measure<R>(metadata: &Metadata, data: &mut R) -> Result<Self, SizesError>
    where
        R: AsyncRead + Unpin,
    {
        let data_size = tokio::io::copy(data, &mut tokio::io::sink()).await?;
        Ok(Self {
            metadata_size: metadata.len(),
            data_size,
        })
    }

    /// Payload size as the signed integer stored in the database
    pub fn data_size_i64(&self) -> Result<i64, SizesError> {
        i64::try_from(self.data_size).map_err(|_| SizesError::TooLarge(self.data_size))
    }
}

/// Add the plugin to a catalog
pub fn register(catalog: &mut PluginCatalog) {
    catalog.register(PLUGIN_NAME, |_config| Ok(Arc::new(SizesPlugin::new()) as Arc<dyn Plugin>));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_measure_counts_entries_and_bytes() {
        let metadata = json!({"camera": "front", "frames": 12, "nested": {"a": 1, "b": 2}})
            .as_object()
            .cloned()
            .unwrap();
        let mut data: &[u8] = b"0123456789";

        let report = SizeReport::measure(&metadata, &mut data).await.unwrap();
        assert_eq!(
            report,
            SizeReport {
                metadata_size: 3,
                data_size: 10
            }
        );
        assert_eq!(report.data_size_i64().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let mut data: &[u8] = b"";
        let report = SizeReport::measure(&Metadata::new(), &mut data).await.unwrap();
        assert_eq!(report.metadata_size, 0);
        assert_eq!(report.data_size, 0);
    }

    #[test]
    fn test_oversized_payload() {
        let report = SizeReport {
            metadata_size: 0,
            data_size: u64::MAX,
        };
        assert!(matches!(report.data_size_i64(), Err(SizesError::TooLarge(_))));
    }

    #[test]
    fn test_register() {
        let mut catalog = PluginCatalog::new();
        register(&mut catalog);
        let factory = catalog.get(PLUGIN_NAME).unwrap();
        let plugin = factory(&pipeline_core::Config::default()).unwrap();
        assert_eq!(plugin.name(), PLUGIN_NAME);
        assert_eq!(plugin.resources().len(), 3);
    }
}
