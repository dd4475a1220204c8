//! Pipeline Core - message-driven plugin processing
//!
//! A broker delivers a message referencing stored content. The core decodes
//! it, fetches the content and its metadata, resolves and validates the mime
//! type, computes a digest and fans the work out to every matching plugin,
//! each isolated from the others and bounded by its own timeout.

pub mod config;
pub mod connector;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod fileinfo;
pub mod manager;
pub mod plugin;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use config::{BrokerPolicy, Config, Isolation, MessageConfig, PluginSettings};
pub use connector::{
    Acknowledge, Broker, ConnectorConfig, ConnectorRegistry, ConnectorRole, DataStore, Database, Delivery,
    DeliveryHandler, MetaStore, Params, Row,
};
pub use decoder::MessageDecoder;
pub use error::{
    ConfigError, ConnectorError, ConnectorResolutionError, DecodeError, PluginError, PluginExecutionError,
    ProcessingError, RegistryError,
};
pub use executor::{PluginExecutor, PluginJob, ProcessExecutor, TaskExecutor, WorkerJob, WorkerReport};
pub use fetch::Fetcher;
pub use fileinfo::AcceptedTypes;
pub use manager::ProcessingManager;
pub use plugin::{Content, Plugin, PluginCatalog, PluginFactory, Resource};
pub use registry::{PluginDescriptor, PluginRegistry, RegistryStatus};
pub use shutdown::{Shutdown, ShutdownGuard};
