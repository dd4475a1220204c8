//! Thumbnail plugin for image content
//!
//! Decodes the payload, scales it to fit `width` x `height` while keeping
//! the aspect ratio, writes it to `output_dir` and records the location.
//!
//! # Configuration
//! ```yaml
//! plugin:
//!   accepted_mime_types: [image/jpeg, image/png, image/gif, image/webp]
//!   output_dir: /var/lib/pipeline/thumbnails
//!   width: 128
//!   height: 128
//! ```

pub mod plugin;

pub use plugin::ThumbnailPlugin;

use image::{ImageFormat, ImageReader};
use pipeline_core::{Config, Plugin, PluginCatalog, PluginError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Catalog name of the plugin
pub const PLUGIN_NAME: &str = "thumbnails";

/// Thumbnail generation errors
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("No output_dir configured for thumbnails")]
    NoOutputDir,
    #[error("Invalid thumbnail size {0}x{1}")]
    InvalidSize(u32, u32),
    #[error("Failed to load image: {0}")]
    ImageLoad(String),
    #[error("Failed to write thumbnail {path}: {reason}")]
    Encode { path: PathBuf, reason: String },
    #[error("Thumbnail task failed: {0}")]
    Task(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ThumbnailError> for PluginError {
    fn from(err: ThumbnailError) -> Self {
        match err {
            ThumbnailError::Io(e) => PluginError::Io(e),
            ThumbnailError::ImageLoad(reason) => PluginError::InvalidInput(reason),
            invalid @ (ThumbnailError::NoOutputDir | ThumbnailError::InvalidSize(..)) => {
                PluginError::InvalidInput(invalid.to_string())
            }
            other => PluginError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Plugin options, read from the `plugin` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Directory receiving the thumbnails
    #[serde(alias = "thumb_dir")]
    pub output_dir: Option<PathBuf>,
    /// Bounding box; the thumbnail keeps the source aspect ratio
    pub width: u32,
    pub height: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            width: 128,
            height: 128,
        }
    }
}

impl ThumbnailConfig {
    fn validate(&self) -> Result<&Path, ThumbnailError> {
        if self.width == 0 || self.height == 0 {
            return Err(ThumbnailError::InvalidSize(self.width, self.height));
        }
        self.output_dir.as_deref().ok_or(ThumbnailError::NoOutputDir)
    }
}

/// A written thumbnail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Creates thumbnails into the configured directory
#[derive(Debug, Clone)]
pub struct Thumbnailer {
    output_dir: PathBuf,
    width: u32,
    height: u32,
}

impl Thumbnailer {
    pub fn new(config: &ThumbnailConfig) -> Result<Self, ThumbnailError> {
        let output_dir = config.validate()?.to_path_buf();
        Ok(Self {
            output_dir,
            width: config.width,
            height: config.height,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Scale the image at `source` and save it as `<name>.<ext>` in the source format
    ///
    /// Decoding and encoding are CPU bound and run on the blocking pool.
    pub async fn create(&self, source: &Path, name: &str) -> Result<Thumbnail, ThumbnailError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let this = self.clone();
        let source = source.to_path_buf();
        let name = file_stem(name);
        tokio::task::spawn_blocking(move || this.create_blocking(&source, &name))
            .await
            .map_err(|e| ThumbnailError::Task(e.to_string()))?
    }

    fn create_blocking(&self, source: &Path, name: &str) -> Result<Thumbnail, ThumbnailError> {
        let reader = ImageReader::open(source)?
            .with_guessed_format()
            .map_err(|e| ThumbnailError::ImageLoad(format!("{}: {}", source.display(), e)))?;
        let format = reader
            .format()
            .ok_or_else(|| ThumbnailError::ImageLoad(format!("{}: unknown image format", source.display())))?;
        let image = reader
            .decode()
            .map_err(|e| ThumbnailError::ImageLoad(format!("{}: {}", source.display(), e)))?;

        let thumbnail = image.thumbnail(self.width, self.height);
        let path = self.output_dir.join(format!("{}.{}", name, extension(format)));
        debug!(
            "Scaled {}x{} to {}x{} at {}",
            image.width(),
            image.height(),
            thumbnail.width(),
            thumbnail.height(),
            path.display()
        );

        thumbnail
            .save_with_format(&path, format)
            .map_err(|e| ThumbnailError::Encode {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Thumbnail {
            path,
            width: thumbnail.width(),
            height: thumbnail.height(),
            format: format!("{format:?}").to_lowercase(),
        })
    }
}

fn extension(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}

/// Message references may contain path separators; keep a flat file name
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "thumbnail".to_string()
    } else {
        stem
    }
}

/// Add the plugin to a catalog; a missing `output_dir` fails plugin loading
pub fn register(catalog: &mut PluginCatalog) {
    catalog.register(PLUGIN_NAME, |config: &Config| {
        let options: ThumbnailConfig = config
            .plugin
            .options()
            .map_err(|e| PluginError::InvalidInput(e.to_string()))?;
        let thumbnailer = Thumbnailer::new(&options)?;
        Ok(Arc::new(ThumbnailPlugin::new(thumbnailer)) as Arc<dyn Plugin>)
    });
}
