//! Integration tests for the resource manager
//!
//! The server runs on an ephemeral port against a registry backed by the
//! in-memory database.

use async_trait::async_trait;
use pipeline_api_server::{serve, ApiState};
use pipeline_common::{Message, Metadata};
use pipeline_connectors::builtin_connectors;
use pipeline_core::{
    Config, Content, Database, Params, Plugin, PluginCatalog, PluginError, PluginRegistry, Resource,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Items;

#[async_trait]
impl Plugin for Items {
    fn name(&self) -> &str {
        "items"
    }

    async fn execute(
        &self,
        _config: &Config,
        _database: &dyn Database,
        _message: Message,
        _metadata: Metadata,
        _content: Content,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn resources(&self) -> Vec<Resource> {
        vec![Resource::new(
            "by-name",
            "Items with the given name",
            "SELECT name, size FROM items WHERE name = %(name)s",
            &["name"],
        )]
    }
}

struct Server {
    base: String,
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Server {
    async fn shutdown(self) {
        self.stop.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start() -> Server {
    let config = Config::from_yaml_str("database:\n  type: memory\nplugin:\n  accepted_mime_types: [text/plain]\n").unwrap();
    let mut catalog = PluginCatalog::new();
    catalog.register("items", |_| Ok(Arc::new(Items) as Arc<dyn Plugin>));
    catalog.register("broken", |_| Err(PluginError::InvalidInput("no output_dir".into())));

    let registry = PluginRegistry::discover(&config, &catalog, &builtin_connectors()).await;
    let database = registry.get("items").unwrap().database.clone();
    for (name, size) in [("a", 1), ("b", 2)] {
        let params = Params::from_iter([
            ("name".to_string(), Value::from(name)),
            ("size".to_string(), Value::from(size)),
        ]);
        database.execute_query("INSERT INTO items (name, size) VALUES (%(name)s, %(size)s)", &params).await.unwrap();
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let stop = CancellationToken::new();
    let handle = tokio::spawn(serve(listener, ApiState::new(Arc::new(registry)), stop.clone()));
    Server { base, stop, handle }
}

#[tokio::test]
async fn test_health_reports_plugin_counts() {
    let server = start().await;
    let response = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["plugins"], json!({"discovered": 2, "registered": 1, "failed": 1, "unloaded": 0}));
    server.shutdown().await;
}

#[tokio::test]
async fn test_plugin_listing() {
    let server = start().await;
    let body: Value = reqwest::get(format!("{}/plugins", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["plugins"][0]["name"], "items");
    assert_eq!(body["plugins"][0]["accepted_mime_types"], json!(["text/plain"]));
    assert_eq!(body["plugins"][0]["resources"][0]["path"], "/plugins/items/by-name");
    assert!(body["plugins"][0]["resources"][0].get("sql").is_none());
    assert_eq!(body["failed"][0]["name"], "broken");
    server.shutdown().await;
}

#[tokio::test]
async fn test_resource_query() {
    let server = start().await;

    let response = reqwest::get(format!("{}/plugins/items/by-name?name=b", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let rows: Value = response.json().await.unwrap();
    assert_eq!(rows, json!([{"name": "b", "size": 2}]));

    let response = reqwest::get(format!("{}/plugins/items/by-name?name=zzz", server.base)).await.unwrap();
    assert_eq!(response.status(), 204);

    let response = reqwest::get(format!("{}/plugins/items/by-name", server.base)).await.unwrap();
    assert_eq!(response.status(), 400);

    let response = reqwest::get(format!("{}/plugins/items/by-size?size=1", server.base)).await.unwrap();
    assert_eq!(response.status(), 404);
    let response = reqwest::get(format!("{}/plugins/broken/by-name?name=a", server.base)).await.unwrap();
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}
