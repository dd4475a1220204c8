//! S3/MinIO data store
//!
//! A reference is either `s3://bucket/key` or a key inside the configured
//! bucket (with `prefix` prepended).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use pipeline_common::LocalContent;
use pipeline_core::{ConnectorConfig, ConnectorError, DataStore};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct S3Options {
    bucket: Option<String>,
    region: Option<String>,
    /// Custom endpoint, e.g. `MinIO`; enables path-style addressing
    endpoint: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    prefix: String,
}

pub struct S3DataStore {
    client: Client,
    bucket: Option<String>,
    prefix: String,
}

impl S3DataStore {
    /// Build a client from explicit credentials, or the default AWS chain when none are set
    pub async fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: S3Options = config.options()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(key), Some(secret)) = (&options.access_key_id, &options.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key, secret, None, None, "pipeline-connectors"));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &options.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: options.bucket,
            prefix: options.prefix,
        })
    }

    fn locate(&self, reference: &str) -> Result<(String, String), ConnectorError> {
        split_location(reference, self.bucket.as_deref(), &self.prefix)
    }
}

/// `(bucket, key)` for a reference
fn split_location(reference: &str, bucket: Option<&str>, prefix: &str) -> Result<(String, String), ConnectorError> {
    if let Some(location) = reference.strip_prefix("s3://") {
        return match location.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket.to_string(), key.to_string())),
            _ => Err(ConnectorError::InvalidConfig(format!(
                "expected s3://bucket/key, got {reference}"
            ))),
        };
    }
    match bucket {
        Some(bucket) => Ok((bucket.to_string(), format!("{prefix}{reference}"))),
        None => Err(ConnectorError::InvalidConfig(format!(
            "'{reference}' has no bucket and none is configured"
        ))),
    }
}

#[async_trait]
impl DataStore for S3DataStore {
    async fn download_to_disk(&self, reference: &str) -> Result<LocalContent, ConnectorError> {
        let (bucket, key) = self.locate(reference)?;
        debug!("S3 bucket: {}, key: {}", bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => ConnectorError::NotFound(format!("s3://{bucket}/{key}")),
                _ => ConnectorError::Connection(e.to_string()),
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?
            .into_bytes();

        let temp = crate::temp_file_for(&key)?;
        let mut file = tokio::fs::File::create(temp.path()).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        debug!("Downloaded {} bytes from S3 to {}", bytes.len(), temp.path().display());
        Ok(LocalContent::temporary(temp))
    }
}
