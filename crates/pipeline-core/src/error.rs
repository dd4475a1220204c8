//! Error types for the processing core

use crate::connector::ConnectorRole;
use pipeline_common::{Disposition, PluginFailure};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Parser ({0}) not implemented")]
    UnsupportedParser(String),

    #[error("The following field(s) are missing in the message: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid connector configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connector error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ConnectorResolutionError {
    #[error("No {role} connector registered for type '{kind}'")]
    UnsupportedConnector { role: ConnectorRole, kind: String },

    #[error("Failed to create {role} connector '{kind}': {source}")]
    Construction {
        role: ConnectorRole,
        kind: String,
        #[source]
        source: ConnectorError,
    },
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] ConnectorError),

    #[error("Plugin execution timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Plugin {0} is not part of the catalog")]
    UnknownPlugin(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connector: {0}")]
    Resolution(#[from] ConnectorResolutionError),

    #[error("Database initialization failed: {0}")]
    Database(#[from] ConnectorError),

    #[error("Plugin error: {0}")]
    PluginError(#[from] PluginError),
}

/// Every plugin failure collected for one message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} plugin(s) failed: {}", .failures.len(), format_failures(.failures))]
pub struct PluginExecutionError {
    pub failures: Vec<PluginFailure>,
}

fn format_failures(failures: &[PluginFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Content not available at this moment: {0}")]
    RetryableLookup(String),

    #[error("Mime type \"{0}\" is not supported by any of the active plugins")]
    UnsupportedMime(String),

    #[error(transparent)]
    PluginExecution(#[from] PluginExecutionError),

    #[error(transparent)]
    ConnectorResolution(#[from] ConnectorResolutionError),

    #[error("Connector error: {0}")]
    Connector(ConnectorError),

    #[error("Could not find \"{0}\" in message")]
    MissingLocation(&'static str),

    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessingError {
    /// Only content that is not available yet is worth retrying
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessingError::RetryableLookup(_) => Disposition::Retry,
            _ => Disposition::Failed,
        }
    }
}

impl From<ConnectorError> for ProcessingError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotFound(reference) => ProcessingError::RetryableLookup(reference),
            other => ProcessingError::Connector(other),
        }
    }
}
