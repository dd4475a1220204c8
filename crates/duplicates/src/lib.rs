//! Duplicate detection plugin
//!
//! Records the SHA-256 of every payload so identical content can be looked
//! up later. The hash is taken, in order of preference, from:
//! - a metadata entry named by `hash_keys` (default `sha256`, `sha-256`, `sha_256`)
//! - the digest the core attached to the message
//! - a streamed hash of the content

pub mod plugin;

pub use plugin::DuplicatesPlugin;

use pipeline_common::{Message, Metadata};
use pipeline_core::{Config, Plugin, PluginCatalog, PluginError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Catalog name of the plugin
pub const PLUGIN_NAME: &str = "duplicates";

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DuplicatesError {
    #[error("Failed to read payload: {0}")]
    Read(#[from] std::io::Error),
    #[error("Metadata entry {key} is not a SHA-256 hex digest: {value}")]
    InvalidDeclaredHash { key: String, value: String },
}

impl From<DuplicatesError> for PluginError {
    fn from(err: DuplicatesError) -> Self {
        match err {
            DuplicatesError::Read(e) => PluginError::Io(e),
            other => PluginError::InvalidInput(other.to_string()),
        }
    }
}

/// Plugin options, read from the `plugin` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicatesConfig {
    /// Metadata keys that may carry a producer-declared hash
    pub hash_keys: Vec<String>,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            hash_keys: vec!["sha256".to_string(), "sha-256".to_string(), "sha_256".to_string()],
        }
    }
}

/// Where the recorded hash came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashSource {
    Metadata,
    Message,
    Content,
}

/// Resolves the SHA-256 for a message
#[derive(Debug, Clone, Default)]
pub struct HashResolver {
    config: DuplicatesConfig,
}

impl HashResolver {
    pub fn new(config: DuplicatesConfig) -> Self {
        Self { config }
    }

    /// Hash declared by the producer in the metadata, lowercased
    pub fn declared(&self, metadata: &Metadata) -> Result<Option<String>, DuplicatesError> {
        for key in &self.config.hash_keys {
            let Some(value) = metadata.get(key).and_then(|v| v.as_str()) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if !is_sha256_hex(value) {
                return Err(DuplicatesError::InvalidDeclaredHash {
                    key: key.clone(),
                    value: value.to_string(),
                });
            }
            return Ok(Some(value.to_ascii_lowercase()));
        }
        Ok(None)
    }

    /// Resolve the hash, reading `data` only when nothing upstream provides one
    pub async fn resolve<R>(
        &self,
        message: &Message,
        metadata: &Metadata,
        data: &mut R,
    ) -> Result<(String, HashSource), DuplicatesError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(hash) = self.declared(metadata)? {
            return Ok((hash, HashSource::Metadata));
        }
        if let Some(digest) = message.hash_digest.as_deref().filter(|d| is_sha256_hex(d)) {
            return Ok((digest.to_ascii_lowercase(), HashSource::Message));
        }
        debug!("Calculating SHA-256 of {}", message.label());
        Ok((sha256_hex(data).await?, HashSource::Content))
    }
}

/// Streamed SHA-256 of a reader as lowercase hex
pub async fn sha256_hex<R>(data: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = data.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Add the plugin to a catalog; options come from the merged plugin config
pub fn register(catalog: &mut PluginCatalog) {
    catalog.register(PLUGIN_NAME, |config: &Config| {
        let options: DuplicatesConfig = config
            .plugin
            .options()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        Ok(Arc::new(DuplicatesPlugin::new(options)) as Arc<dyn Plugin>)
    });
}
