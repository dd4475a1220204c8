//! HTTP/HTTPS data store
//!
//! References are absolute URLs, or paths joined onto `base_url`. The body is
//! streamed into a temporary file carrying the URL's extension.

use async_trait::async_trait;
use futures::StreamExt;
use pipeline_common::LocalContent;
use pipeline_core::{ConnectorConfig, ConnectorError, DataStore};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct HttpOptions {
    base_url: Option<String>,
    timeout_seconds: u64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_seconds: 300,
        }
    }
}

pub struct HttpDataStore {
    client: Client,
    base_url: Option<String>,
}

impl HttpDataStore {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: HttpOptions = config.options()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ConnectorError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: options.base_url,
        })
    }

    fn url(&self, reference: &str) -> Result<String, ConnectorError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(reference.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                reference.trim_start_matches('/')
            )),
            None => Err(ConnectorError::InvalidConfig(format!(
                "'{reference}' is not an http(s) URL and no base_url is configured"
            ))),
        }
    }
}

/// Last path segment of a URL, without query or fragment
fn file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl DataStore for HttpDataStore {
    async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError> {
        let url = self.url(reference)?;
        debug!("Downloading {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Err(ConnectorError::NotFound(url)),
            status if !status.is_success() => {
                return Err(ConnectorError::Connection(format!("GET {url} returned {status}")));
            }
            _ => {}
        }

        let temp = crate::temp_file_for(file_name(&url))?;
        let mut file = File::create(temp.path()).await?;
        let mut written = 0usize;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ConnectorError::Connection(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        debug!("Downloaded {} bytes to {}", written, temp.path().display());
        Ok(LocalContent::temporary(temp))
    }
}
