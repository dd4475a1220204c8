//! API response types

use pipeline_core::{PluginDescriptor, RegistryStatus, Resource};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub plugins: PluginCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginCounts {
    pub discovered: usize,
    pub registered: usize,
    pub failed: usize,
    pub unloaded: usize,
}

impl From<&RegistryStatus> for PluginCounts {
    fn from(status: &RegistryStatus) -> Self {
        Self {
            discovered: status.discovered,
            registered: status.registered.len(),
            failed: status.failed.len(),
            unloaded: status.unloaded.len(),
        }
    }
}

/// A query a plugin serves; the SQL text stays private
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub description: String,
    pub params: Vec<String>,
    pub path: String,
}

impl ResourceInfo {
    pub fn new(plugin: &str, resource: &Resource) -> Self {
        Self {
            name: resource.name.clone(),
            description: resource.description.clone(),
            params: resource.params.clone(),
            path: format!("/plugins/{}/{}", plugin, resource.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub accepted_mime_types: Vec<String>,
    pub timeout_seconds: u64,
    pub resources: Vec<ResourceInfo>,
}

impl From<&PluginDescriptor> for PluginInfo {
    fn from(descriptor: &PluginDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            accepted_mime_types: descriptor.accepted_mime_types().to_vec(),
            timeout_seconds: descriptor.timeout().as_secs(),
            resources: descriptor
                .resources()
                .iter()
                .map(|r| ResourceInfo::new(&descriptor.name, r))
                .collect(),
        }
    }
}

/// Plugin listing including the ones that did not load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsResponse {
    pub plugins: Vec<PluginInfo>,
    pub failed: Vec<FailedInfo>,
    pub unloaded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedInfo {
    pub name: String,
    pub error: String,
}

/// Error body returned with every non-success status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}
