//! Local filesystem data and metadata stores

use crate::temp_file_for;
use async_trait::async_trait;
use pipeline_common::LocalContent;
use pipeline_core::{ConnectorConfig, ConnectorError, DataStore, MetaStore};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DiskOptions {
    /// Base directory for relative references
    root: Option<PathBuf>,
    /// Copy content to a temporary file instead of handing out the original path
    copy: bool,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self { root: None, copy: true }
    }
}

fn resolve(root: Option<&Path>, reference: &str) -> Result<PathBuf, ConnectorError> {
    if reference.is_empty() {
        return Err(ConnectorError::InvalidConfig("empty disk reference".to_string()));
    }
    Ok(match root {
        Some(root) => root.join(reference),
        None => PathBuf::from(reference),
    })
}

fn not_found(reference: &str, e: std::io::Error) -> ConnectorError {
    if e.kind() == ErrorKind::NotFound {
        ConnectorError::NotFound(reference.to_string())
    } else {
        ConnectorError::Io(e)
    }
}

/// Content store reading from a local or mounted filesystem
#[derive(Debug, Clone)]
pub struct DiskDataStore {
    root: Option<PathBuf>,
    copy: bool,
}

impl DiskDataStore {
    pub fn new(root: Option<PathBuf>, copy: bool) -> Self {
        Self { root, copy }
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: DiskOptions = config.options()?;
        Ok(Self::new(options.root, options.copy))
    }
}

#[async_trait]
impl DataStore for DiskDataStore {
    async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError> {
        let source = resolve(self.root.as_deref(), reference)?;
        let metadata = tokio::fs::metadata(&source).await.map_err(|e| not_found(reference, e))?;
        if !metadata.is_file() {
            return Err(ConnectorError::NotFound(format!("{reference} is not a file")));
        }

        if !self.copy {
            return Ok(LocalContent::persistent(source));
        }

        let temp = temp_file_for(reference)?;
        debug!("Copying {} to {}", source.display(), temp.path().display());
        tokio::fs::copy(&source, temp.path())
            .await
            .map_err(|e| not_found(reference, e))?;
        Ok(LocalContent::temporary(temp))
    }
}

/// Metadata store reading JSON documents from files
#[derive(Debug, Clone)]
pub struct DiskMetaStore {
    root: Option<PathBuf>,
}

impl DiskMetaStore {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: DiskOptions = config.options()?;
        Ok(Self::new(options.root))
    }
}

#[async_trait]
impl MetaStore for DiskMetaStore {
    async fn fetch_metadata(&self, reference: &str) -> Result<Vec<u8>, ConnectorError> {
        let path = resolve(self.root.as_deref(), reference)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| not_found(reference, e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ConnectorError::NotFound(format!("{reference} is empty")));
        }
        Ok(bytes)
    }
}
