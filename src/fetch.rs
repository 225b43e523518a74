//! Metadata, image, and collection-stats fetching
//!
//! All outbound HTTP goes through a bounded-timeout reqwest client. Token
//! URIs may use `http(s)://` or `ipfs://`; the latter is rewritten to the
//! configured gateway. Responses missing a usable content type are sniffed
//! from magic bytes.

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::model::CollectionMetadata;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, warn};

// ============================================================================
// Metadata fetcher
// ============================================================================

pub struct MetadataFetcher {
    client: reqwest::Client,
    ipfs_gateway: String,
    max_attempts: u32,
    retry_delay: std::time::Duration,
}

impl MetadataFetcher {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            ipfs_gateway: cfg.ipfs_gateway.clone(),
            max_attempts: cfg.max_attempts,
            retry_delay: cfg.retry_delay,
        })
    }

    /// Rewrite `ipfs://` URIs to the configured gateway; pass through
    /// everything else.
    pub fn resolve_url(&self, uri: &str) -> String {
        if let Some(rest) = uri.strip_prefix("ipfs://") {
            let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
            format!("{}{}", self.ipfs_gateway, rest)
        } else {
            uri.to_string()
        }
    }

    /// GET a JSON document. Requires HTTP 200; transient failures (429, 5xx,
    /// timeouts) are retried with a fixed delay.
    pub async fn fetch_json(&self, uri: &str) -> Result<serde_json::Value> {
        let bytes = self.get_with_retry(uri).await?.0;
        serde_json::from_slice(&bytes).map_err(|e| Error::Fetch {
            url: uri.to_string(),
            message: format!("invalid JSON body: {}", e).into(),
            retryable: false,
        })
    }

    /// GET raw bytes plus a content type (header, or sniffed from magic
    /// bytes when the header is missing or generic).
    pub async fn fetch_bytes(&self, uri: &str) -> Result<(Vec<u8>, String)> {
        let (bytes, header_type) = self.get_with_retry(uri).await?;
        let content_type = match header_type {
            Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct,
            _ => sniff_content_type(&bytes).unwrap_or_default().to_string(),
        };
        Ok((bytes, content_type))
    }

    async fn get_with_retry(&self, uri: &str) -> Result<(Vec<u8>, Option<String>)> {
        let url = self.resolve_url(uri);
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match self.get_once(&url).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(
                        "GET {} failed (attempt {}/{}): {}",
                        url, attempt, self.max_attempts, e
                    );
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Fetch {
            url,
            message: "retries exhausted".into(),
            retryable: false,
        }))
    }

    async fn get_once(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self.client.get(url).send().await.map_err(|e| Error::Fetch {
            url: url.to_string(),
            message: e.to_string().into(),
            retryable: e.is_timeout() || e.is_connect(),
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Fetch {
                url: url.to_string(),
                message: format!("unexpected status {}", status).into(),
                retryable: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string());

        let bytes = response.bytes().await.map_err(|e| Error::Fetch {
            url: url.to_string(),
            message: format!("body read failed: {}", e).into(),
            retryable: true,
        })?;

        Ok((bytes.to_vec(), content_type))
    }
}

/// Best-effort content type from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"<svg") || bytes.starts_with(b"<?xml") {
        Some("image/svg+xml")
    } else {
        None
    }
}

/// Content-addressed blob path for an image.
pub fn image_path(chain_id: &str, collection_address: &str, bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!(
        "images/{}/collections/{}/{}",
        chain_id,
        collection_address,
        hex::encode(digest)
    )
}

// ============================================================================
// Blob store
// ============================================================================

/// Idempotent blob storage: uploading to an existing path is a no-op.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], path: &str, content_type: &str) -> Result<String>;
}

/// Filesystem-backed blob store serving objects under a public base URL.
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, bytes: &[u8], path: &str, _content_type: &str) -> Result<String> {
        let full = self.root.join(path);
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);

        if tokio::fs::try_exists(&full).await? {
            debug!("blob already present, skipping upload: {}", path);
            return Ok(url);
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        Ok(url)
    }
}

// ============================================================================
// Collection stats provider
// ============================================================================

/// External provider of collection-level display metadata.
#[async_trait]
pub trait CollectionStatsProvider: Send + Sync {
    async fn collection_metadata(
        &self,
        chain_id: &str,
        address: &str,
    ) -> Result<CollectionMetadata>;
}

/// HTTP stats provider. With no base URL configured it degrades to empty
/// metadata rather than failing the pipeline.
pub struct HttpStatsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatsProvider {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: cfg.stats_api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CollectionStatsProvider for HttpStatsProvider {
    async fn collection_metadata(
        &self,
        chain_id: &str,
        address: &str,
    ) -> Result<CollectionMetadata> {
        if self.base_url.is_empty() {
            debug!("no stats provider configured, using empty collection metadata");
            return Ok(CollectionMetadata::default());
        }

        let url = format!("{}/collections/{}/{}", self.base_url, chain_id, address);
        let response = self.client.get(&url).send().await.map_err(|e| Error::Fetch {
            url: url.clone(),
            message: e.to_string().into(),
            retryable: e.is_timeout() || e.is_connect(),
        })?;

        if response.status() != StatusCode::OK {
            return Err(Error::Fetch {
                url,
                message: format!("unexpected status {}", response.status()).into(),
                retryable: response.status().is_server_error(),
            });
        }

        response.json().await.map_err(|e| Error::Fetch {
            url,
            message: format!("invalid stats body: {}", e).into(),
            retryable: false,
        })
    }
}
