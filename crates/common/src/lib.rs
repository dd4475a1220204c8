//! Common types shared by the pipeline core, connectors and plugins

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Structured metadata attached to a message
pub type Metadata = Map<String, Value>;

/// One unit of work announced by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id generated on decode, never taken from the wire
    pub id: String,

    /// External reference supplied by the producer
    pub uuid: Option<String>,

    /// Mime type, inferred during the query phase when absent
    #[serde(rename = "type")]
    pub mime_type: Option<String>,

    /// Inline metadata, either a JSON object or a JSON encoded string
    pub metadata: Option<Value>,

    /// Pointer into the data store
    pub data_location: String,

    /// Pointer into the metadata store
    pub meta_location: Option<String>,

    /// Hex encoded content digest, computed by the core
    pub hash_digest: Option<String>,

    /// Full decoded payload
    pub body: Map<String, Value>,
}

impl Message {
    /// Create a message with a fresh correlation id
    pub fn new(data_location: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            uuid: None,
            mime_type: None,
            metadata: None,
            data_location: data_location.into(),
            meta_location: None,
            hash_digest: None,
            body: Map::new(),
        }
    }

    /// Short label used in log lines
    pub fn label(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.id)
    }
}

/// How a plugin invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The plugin returned an error
    Error,
    /// The plugin exceeded its timeout
    Timeout,
    /// The plugin panicked inside its task
    Panic,
    /// The worker process died or produced no report
    Crash,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Panic => "panic",
            FailureKind::Crash => "crash",
        };
        f.write_str(s)
    }
}

/// A single plugin failure for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFailure {
    pub plugin: String,
    pub reason: String,
    pub kind: FailureKind,
}

impl PluginFailure {
    pub fn new(plugin: impl Into<String>, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            reason: reason.into(),
            kind,
        }
    }
}

impl fmt::Display for PluginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.plugin, self.kind, self.reason)
    }
}

/// Payload published to the dead-letter channel, one per failing plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub plugin: String,
    pub kind: FailureKind,
    pub routing_key: Option<String>,
    pub message_id: String,
    pub uuid: Option<String>,
    pub body: Map<String, Value>,
}

impl DeadLetter {
    pub fn new(message: &Message, failure: &PluginFailure, routing_key: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            reason: failure.reason.clone(),
            plugin: failure.plugin.clone(),
            kind: failure.kind,
            routing_key: routing_key.map(str::to_string),
            message_id: message.id.clone(),
            uuid: message.uuid.clone(),
            body: message.body.clone(),
        }
    }
}

/// Terminal state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Every selected plugin succeeded, ack
    Done,
    /// Content or metadata not available yet, nack with requeue
    Retry,
    /// Permanent failure, nack without requeue unless configured otherwise
    Failed,
}

/// Content materialized on local disk
///
/// Temporary copies are removed when this value is dropped.
#[derive(Debug)]
pub struct LocalContent {
    path: PathBuf,
    temp_file: Option<NamedTempFile>,
}

impl LocalContent {
    /// Reference a file that outlives the message
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temp_file: None,
        }
    }

    /// Take ownership of a temporary copy
    pub fn temporary(temp_file: NamedTempFile) -> Self {
        let path = temp_file.path().to_path_buf();
        Self {
            path,
            temp_file: Some(temp_file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp_file.is_some()
    }
}

impl AsRef<Path> for LocalContent {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}
