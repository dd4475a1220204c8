//! Content and metadata retrieval for a message

use crate::config::Config;
use crate::connector::{ConnectorConfig, ConnectorRegistry, DataStore, MetaStore};
use crate::error::{ConnectorError, ProcessingError};
use pipeline_common::{LocalContent, Message, Metadata};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Fetches content from the data store and metadata from inline data or the meta store
///
/// The data store is resolved eagerly since every message needs it. The meta
/// store is optional and resolved on first use, so a bad meta store section
/// fails the messages that need it instead of the whole process.
pub struct Fetcher {
    data_store: Arc<dyn DataStore>,
    meta_store_config: Option<ConnectorConfig>,
    meta_store: OnceCell<Arc<dyn MetaStore>>,
    connectors: ConnectorRegistry,
}

impl Fetcher {
    pub async fn new(config: &Config, connectors: &ConnectorRegistry) -> Result<Self, ProcessingError> {
        let data_store = connectors.data_store(&config.data_store).await?;
        Ok(Self::with_data_store(data_store, config.meta_store.clone(), connectors.clone()))
    }

    pub fn with_data_store(
        data_store: Arc<dyn DataStore>,
        meta_store_config: Option<ConnectorConfig>,
        connectors: ConnectorRegistry,
    ) -> Self {
        Self {
            data_store,
            meta_store_config,
            meta_store: OnceCell::new(),
            connectors,
        }
    }

    /// Materialize the content referenced by `data_location`
    pub async fn fetch_content(&self, message: &Message) -> Result<LocalContent, ProcessingError> {
        if message.data_location.is_empty() {
            return Err(ProcessingError::MissingLocation("data_location"));
        }

        self.data_store
            .download_to_disk(&message.data_location)
            .await
            .map_err(|e| lookup_error("Data", &message.data_location, e))
    }

    /// Inline metadata first, then the meta store, else an empty map
    pub async fn fetch_metadata(&self, message: &Message) -> Result<Metadata, ProcessingError> {
        if let Some(inline) = message.metadata.as_ref().filter(|v| !is_blank(v)) {
            info!("Loading metadata from message {}", message.label());
            return parse_inline(inline);
        }

        let Some(store_config) = &self.meta_store_config else {
            debug!("No metadata storage configured, skipping metadata retrieval");
            return Ok(Metadata::new());
        };

        let location = message
            .meta_location
            .as_deref()
            .filter(|loc| !loc.is_empty())
            .ok_or(ProcessingError::MissingLocation("meta_location"))?;

        info!("Fetching metadata for {} by query", message.label());
        let store = self
            .meta_store
            .get_or_try_init(|| self.connectors.meta_store(store_config))
            .await?;

        let raw = store
            .fetch_metadata(location)
            .await
            .map_err(|e| lookup_error("Metadata", location, e))?;

        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ProcessingError::MalformedMetadata(format!(
                "metadata at {location} is not a JSON object"
            ))),
            Err(e) => Err(ProcessingError::MalformedMetadata(e.to_string())),
        }
    }

    /// Content and metadata for a message
    pub async fn query(&self, message: &Message) -> Result<(LocalContent, Metadata), ProcessingError> {
        info!("Querying metadata and content stores for {}", message.label());
        let content = self.fetch_content(message).await?;
        let metadata = self.fetch_metadata(message).await?;
        debug!("Queries completed for {}", message.label());
        Ok((content, metadata))
    }
}

fn lookup_error(what: &str, reference: &str, err: ConnectorError) -> ProcessingError {
    match err {
        ConnectorError::NotFound(detail) => {
            warn!("{} by reference {} was not available at this moment: {}", what, reference, detail);
            ProcessingError::RetryableLookup(format!("{reference}: {detail}"))
        }
        other => ProcessingError::Connector(other),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn parse_inline(value: &Value) -> Result<Metadata, ProcessingError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ProcessingError::MalformedMetadata(
                "inline metadata is not a JSON object".to_string(),
            )),
            Err(e) => Err(ProcessingError::MalformedMetadata(e.to_string())),
        },
        _ => Err(ProcessingError::MalformedMetadata(
            "inline metadata must be an object or a JSON string".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PathStore;

    #[async_trait]
    impl DataStore for PathStore {
        async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError> {
            if reference == "missing" {
                return Err(ConnectorError::NotFound(reference.to_string()));
            }
            if reference == "broken" {
                return Err(ConnectorError::Connection("refused".to_string()));
            }
            Ok(LocalContent::persistent(reference))
        }
    }

    struct MapStore(HashMap<String, Vec<u8>>, Arc<AtomicUsize>);

    #[async_trait]
    impl MetaStore for MapStore {
        async fn fetch_metadata(&self, reference: &str) -> Result<Vec<u8>, ConnectorError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
                .get(reference)
                .cloned()
                .ok_or_else(|| ConnectorError::NotFound(reference.to_string()))
        }
    }

    fn message(value: serde_json::Value) -> Message {
        crate::decoder::decode(value.to_string().as_bytes(), &Default::default()).unwrap()
    }

    fn fetcher_with_meta(calls: Arc<AtomicUsize>) -> Fetcher {
        let mut connectors = ConnectorRegistry::new();
        connectors.register_meta_store("map", move |_config| {
            let calls = calls.clone();
            async move {
                let mut entries = HashMap::new();
                entries.insert("store/u1".to_string(), br#"{"camera": "x100"}"#.to_vec());
                entries.insert("store/bad".to_string(), b"[1]".to_vec());
                Ok::<_, ConnectorError>(Arc::new(MapStore(entries, calls)) as Arc<dyn MetaStore>)
            }
        });
        Fetcher::with_data_store(Arc::new(PathStore), Some(ConnectorConfig::new("map")), connectors)
    }

    #[tokio::test]
    async fn test_no_meta_store_gives_empty_metadata() {
        let fetcher = Fetcher::with_data_store(Arc::new(PathStore), None, ConnectorRegistry::new());
        let msg = message(json!({"uuid": "u1", "data_location": "/tmp/f.jpg", "meta_location": "store/u1"}));

        let (content, metadata) = fetcher.query(&msg).await.unwrap();
        assert_eq!(content.path(), std::path::Path::new("/tmp/f.jpg"));
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn test_missing_content_is_retryable() {
        let fetcher = Fetcher::with_data_store(Arc::new(PathStore), None, ConnectorRegistry::new());
        let msg = message(json!({"uuid": "u1", "data_location": "missing", "meta_location": "m"}));
        let err = fetcher.fetch_content(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessingError::RetryableLookup(_)));

        let msg = message(json!({"uuid": "u1", "data_location": "broken", "meta_location": "m"}));
        let err = fetcher.fetch_content(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Connector(_)));
    }

    #[tokio::test]
    async fn test_inline_metadata_takes_priority() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_with_meta(calls.clone());

        let msg = message(json!({
            "uuid": "u1", "data_location": "/f", "meta_location": "store/u1",
            "metadata": "{\"inline\": true}"
        }));
        let metadata = fetcher.fetch_metadata(&msg).await.unwrap();
        assert_eq!(metadata["inline"], json!(true));

        let msg = message(json!({
            "uuid": "u1", "data_location": "/f", "meta_location": "store/u1",
            "metadata": {"inline": "object"}
        }));
        let metadata = fetcher.fetch_metadata(&msg).await.unwrap();
        assert_eq!(metadata["inline"], json!("object"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_meta_store_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_with_meta(calls.clone());

        let msg = message(json!({"uuid": "u1", "data_location": "/f", "meta_location": "store/u1"}));
        let metadata = fetcher.fetch_metadata(&msg).await.unwrap();
        assert_eq!(metadata["camera"], json!("x100"));

        let msg = message(json!({"uuid": "u2", "data_location": "/f", "meta_location": "store/u2"}));
        let err = fetcher.fetch_metadata(&msg).await.unwrap_err();
        assert_eq!(err.disposition(), pipeline_common::Disposition::Retry);

        let msg = message(json!({"uuid": "u3", "data_location": "/f", "meta_location": "store/bad"}));
        let err = fetcher.fetch_metadata(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedMetadata(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_meta_store_fails_the_message() {
        let fetcher = Fetcher::with_data_store(
            Arc::new(PathStore),
            Some(ConnectorConfig::new("swift")),
            ConnectorRegistry::new(),
        );
        let msg = message(json!({"uuid": "u1", "data_location": "/f", "meta_location": "store/u1"}));
        let err = fetcher.fetch_metadata(&msg).await.unwrap_err();
        assert!(matches!(err, ProcessingError::ConnectorResolution(_)));
        assert_eq!(err.disposition(), pipeline_common::Disposition::Failed);
    }

    #[test]
    fn test_malformed_inline_metadata() {
        assert!(parse_inline(&json!("not json")).is_err());
        assert!(parse_inline(&json!(42)).is_err());
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!({})));
    }
}
