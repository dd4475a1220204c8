//! Plugin trait and related types

use crate::config::Config;
use crate::connector::Database;
use crate::error::PluginError;
use async_trait::async_trait;
use pipeline_common::{Message, Metadata};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

/// Core plugin trait - all plugins must implement this
///
/// A plugin receives its own copy of the message and metadata and a fresh read
/// handle to the content. It must return an error to signal failure; a plugin
/// that swallows errors is treated as successful.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin identifier
    fn name(&self) -> &str;

    /// Process one message
    async fn execute(
        &self,
        config: &Config,
        database: &dyn Database,
        message: Message,
        metadata: Metadata,
        content: Content,
    ) -> Result<(), PluginError>;

    /// Named queries served over HTTP
    fn resources(&self) -> Vec<Resource> {
        Vec::new()
    }
}

/// A read-only SQL query a plugin exposes to the resource manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub description: String,
    /// Query text with `%(name)s` placeholders
    pub sql: String,
    /// Parameters taken from the request query string
    pub params: Vec<String>,
}

impl Resource {
    pub fn new(name: &str, description: &str, sql: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            sql: sql.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Sequential, read-once handle to the fetched content
pub struct Content {
    path: PathBuf,
    reader: BufReader<File>,
}

impl Content {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
        })
    }

    /// Local path of the content, for libraries that need a file name
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the remaining bytes and close the handle
    pub async fn read_all(mut self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.reader.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content").field("path", &self.path).finish()
    }
}

impl AsyncRead for Content {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Builds a plugin from its merged configuration
pub type PluginFactory = Arc<dyn Fn(&Config) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// Compiled-in plugin table, in registration order
#[derive(Clone, Default)]
pub struct PluginCatalog {
    entries: Vec<(String, PluginFactory)>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory; a second registration under the same name replaces the first
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        let factory: PluginFactory = Arc::new(factory);
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name.to_string(), factory)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(name, _)| name)).finish()
    }
}
