//! HTTP request handlers for API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pipeline_core::Params;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use crate::types::{ErrorResponse, FailedInfo, HealthResponse, PluginCounts, PluginInfo, PluginsResponse};
use crate::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, details: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details: details.into(),
        }),
    )
}

/// Health check endpoint with plugin counts
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.registry.status();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        plugins: PluginCounts::from(&status),
    })
}

/// Active plugins with their resources, plus failed and unloaded ones
pub async fn list_plugins(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = &state.registry;
    Json(PluginsResponse {
        plugins: registry.plugins().iter().map(PluginInfo::from).collect(),
        failed: registry
            .failed()
            .iter()
            .map(|f| FailedInfo {
                name: f.name.clone(),
                error: f.error.clone(),
            })
            .collect(),
        unloaded: registry.unloaded().iter().map(|u| u.name.clone()).collect(),
    })
}

/// Run a plugin resource with parameters from the query string
///
/// Answers 200 with the rows, 204 when nothing matched, 400 when a declared
/// parameter is missing and 404 for unknown plugins or resources.
pub async fn query_resource(
    State(state): State<ApiState>,
    Path((plugin, resource)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    let descriptor = state
        .registry
        .get(&plugin)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Unknown plugin", plugin.clone()))?;
    let resource = descriptor
        .resources()
        .into_iter()
        .find(|r| r.name == resource)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Unknown resource", format!("{plugin}/{resource}")))?;

    let mut params = Params::new();
    for name in &resource.params {
        let value = query.get(name).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "The request was not complete",
                format!("missing query parameter {name}"),
            )
        })?;
        params.insert(name.clone(), Value::String(value.clone()));
    }

    info!("Fetching {}/{} with {:?}", plugin, resource.name, params);
    let rows = descriptor
        .database
        .execute_query(&resource.sql, &params)
        .await
        .map_err(|e| {
            error!("Resource {}/{} failed: {}", plugin, resource.name, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Query failed", e.to_string())
        })?;

    if rows.is_empty() {
        debug!("No entries for {}/{}", plugin, resource.name);
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(rows).into_response())
}
