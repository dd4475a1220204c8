//! Resource manager: HTTP surface over the plugin registry
//!
//! - `GET /health`: service status and plugin counts
//! - `GET /plugins`: active plugins, their accepted types and resources
//! - `GET /plugins/{plugin}/{resource}?param=value`: run a plugin resource

mod handlers;
mod types;

use axum::{routing::get, Router};
use pipeline_core::PluginRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::*;
pub use types::*;

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<PluginRegistry>,
}

impl ApiState {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/plugins", get(list_plugins))
        .route("/plugins/{plugin}/{resource}", get(query_resource))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `stop` is cancelled
pub async fn serve(listener: TcpListener, state: ApiState, stop: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Resource manager listening on {}", addr);
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_info_path() {
        let resource = pipeline_core::Resource::new("by-uuid", "by uuid", "SELECT 1", &["uuid"]);
        let info = ResourceInfo::new("sizes", &resource);
        assert_eq!(info.path, "/plugins/sizes/by-uuid");
        assert_eq!(info.params, vec!["uuid".to_string()]);
    }

    #[test]
    fn test_empty_registry_state() {
        let state = ApiState::new(Arc::new(PluginRegistry::default()));
        let counts = PluginCounts::from(&state.registry.status());
        assert_eq!(counts.registered, 0);
        assert_eq!(counts.discovered, 0);
    }
}
