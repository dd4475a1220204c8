//! Mime type resolution, acceptance checks and content digests

use crate::config::MimeConfig;
use crate::error::ProcessingError;
use pipeline_common::Metadata;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// Read size used when hashing content
pub const CHUNK_SIZE: usize = 65536;

/// Bytes inspected for magic numbers
const SNIFF_SIZE: usize = 8192;

pub const WILDCARD: &str = "*";

/// Resolve a mime type: metadata declaration, then content sniffing, then octet-stream
pub fn get_mime_type(path: &Path, metadata: &Metadata, mime: Option<&MimeConfig>) -> String {
    mime_from_metadata(metadata, mime)
        .or_else(|| guess_mime_type(path))
        .unwrap_or_else(|| APPLICATION_OCTET_STREAM.to_string())
}

/// Walk `mime.path` through the metadata map
pub fn mime_from_metadata(metadata: &Metadata, mime: Option<&MimeConfig>) -> Option<String> {
    let mime = mime?;
    if mime.path.is_empty() {
        return None;
    }

    let mut keys = mime.path.split(mime.path_separator.as_str());
    let first = keys.next()?;
    let mut value = metadata.get(first)?;
    for key in keys {
        value = value.as_object()?.get(key)?;
    }

    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Sniff magic bytes, falling back to the file extension
pub fn guess_mime_type(path: &Path) -> Option<String> {
    debug!("Guessing mime type of {}", path.display());
    sniff(path).or_else(|| mime_from_extension(path).map(str::to_string))
}

fn sniff(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buffer = [0u8; SNIFF_SIZE];
    let n = file.read(&mut buffer).ok()?;
    infer::get(&buffer[..n]).map(|kind| kind.mime_type().to_string())
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "md" => "text/markdown",
        "svg" => "image/svg+xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime)
}

/// Union of the types accepted by the active plugins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcceptedTypes {
    wildcard: bool,
    types: BTreeSet<String>,
}

impl AcceptedTypes {
    /// A plugin without declared types accepts everything
    pub fn add_plugin(&mut self, declared: &[String]) {
        if declared.is_empty() {
            self.wildcard = true;
            return;
        }
        for mime in declared {
            if mime == WILDCARD {
                self.wildcard = true;
            } else {
                self.types.insert(mime.clone());
            }
        }
    }

    pub fn from_plugins<'a>(plugins: impl IntoIterator<Item = &'a [String]>) -> Self {
        let mut accepted = Self::default();
        for declared in plugins {
            accepted.add_plugin(declared);
        }
        accepted
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.types.is_empty()
    }

    /// An empty set, i.e. no active plugin, accepts everything
    pub fn accepts(&self, mime: &str) -> bool {
        self.is_empty() || self.wildcard || self.types.contains(mime)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }
}

/// Whether a single plugin's declared list matches a mime type
pub fn plugin_accepts(declared: &[String], mime: &str) -> bool {
    declared.is_empty() || declared.iter().any(|t| t == WILDCARD || t == mime)
}

pub fn validate_mime_type(mime: &str, accepted: &AcceptedTypes) -> Result<(), ProcessingError> {
    debug!("Validating mime type {} against {:?}", mime, accepted);
    if accepted.accepts(mime) {
        Ok(())
    } else {
        Err(ProcessingError::UnsupportedMime(mime.to_string()))
    }
}

/// Hex SHA-256 of a file, read in fixed-size chunks
pub async fn compute_digest(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const PNG_HEADER: [u8; 16] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    ];

    fn mime_config(path: &str, sep: &str) -> MimeConfig {
        MimeConfig {
            path: path.to_string(),
            path_separator: sep.to_string(),
        }
    }

    fn metadata(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_mime_from_metadata_path() {
        let meta = metadata(json!({"file": {"info": {"mime": "image/tiff"}}}));
        assert_eq!(
            mime_from_metadata(&meta, Some(&mime_config("file.info.mime", "."))),
            Some("image/tiff".to_string())
        );
        assert_eq!(
            mime_from_metadata(&meta, Some(&mime_config("file/info/mime", "/"))),
            Some("image/tiff".to_string())
        );
        assert_eq!(mime_from_metadata(&meta, Some(&mime_config("file.other", "."))), None);
        assert_eq!(mime_from_metadata(&meta, None), None);
    }

    #[test]
    fn test_guess_from_magic_bytes_then_extension() {
        let mut png = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        png.write_all(&PNG_HEADER).unwrap();
        assert_eq!(guess_mime_type(png.path()), Some("image/png".to_string()));

        let mut text = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        text.write_all(b"a,b\n1,2\n").unwrap();
        assert_eq!(guess_mime_type(text.path()), Some("text/csv".to_string()));

        let mut unknown = tempfile::NamedTempFile::new().unwrap();
        unknown.write_all(b"plain words").unwrap();
        assert_eq!(
            get_mime_type(unknown.path(), &Metadata::new(), None),
            APPLICATION_OCTET_STREAM
        );
    }

    #[test]
    fn test_metadata_wins_over_sniffing() {
        let mut png = tempfile::NamedTempFile::new().unwrap();
        png.write_all(&PNG_HEADER).unwrap();
        let meta = metadata(json!({"mime": "image/x-custom"}));
        assert_eq!(
            get_mime_type(png.path(), &meta, Some(&mime_config("mime", "."))),
            "image/x-custom"
        );
    }

    #[test]
    fn test_accepted_types_union() {
        let jpeg = vec!["image/jpeg".to_string()];
        let png = vec!["image/png".to_string()];
        let accepted = AcceptedTypes::from_plugins([jpeg.as_slice(), png.as_slice()]);
        assert!(accepted.accepts("image/jpeg"));
        assert!(accepted.accepts("image/png"));
        assert!(!accepted.accepts("text/plain"));
        assert!(validate_mime_type("text/plain", &accepted).is_err());

        let wildcard = vec![WILDCARD.to_string()];
        let accepted = AcceptedTypes::from_plugins([jpeg.as_slice(), wildcard.as_slice()]);
        assert!(accepted.is_wildcard());
        assert!(accepted.accepts("application/pdf"));

        let undeclared: Vec<String> = Vec::new();
        let accepted = AcceptedTypes::from_plugins([jpeg.as_slice(), undeclared.as_slice()]);
        assert!(accepted.accepts("video/mp4"));
    }

    #[test]
    fn test_no_plugins_accepts_everything() {
        let accepted = AcceptedTypes::default();
        assert!(accepted.is_empty());
        assert!(validate_mime_type("anything/at-all", &accepted).is_ok());
    }

    #[test]
    fn test_plugin_accepts() {
        let jpeg = vec!["image/jpeg".to_string()];
        assert!(plugin_accepts(&jpeg, "image/jpeg"));
        assert!(!plugin_accepts(&jpeg, "image/png"));
        assert!(plugin_accepts(&[], "image/png"));
        assert!(plugin_accepts(&[WILDCARD.to_string()], "image/png"));
    }

    #[tokio::test]
    async fn test_digest_is_stable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        let first = compute_digest(file.path()).await.unwrap();
        let second = compute_digest(file.path()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hex::encode(Sha256::digest(&data)));

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            compute_digest(empty.path()).await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
