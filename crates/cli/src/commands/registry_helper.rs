//! Shared plugin catalog and connector registry
//!
//! Every command that needs plugins or connectors builds them here, so the
//! worker process sees exactly the same catalog as its parent.

use pipeline_core::{ConnectorRegistry, PluginCatalog};

/// Catalog of the compiled-in plugins, in dispatch order
///
/// - sizes
/// - duplicates
/// - thumbnails
pub fn builtin_catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    pipeline_sizes::register(&mut catalog);
    pipeline_duplicates::register(&mut catalog);
    pipeline_thumbnails::register(&mut catalog);
    catalog
}

/// Brokers, stores and databases available to the configuration
pub fn builtin_connectors() -> ConnectorRegistry {
    pipeline_connectors::builtin_connectors()
}
