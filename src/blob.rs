//! Object storage for appeal proof images.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::FulfillmentError;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("upload timed out")]
    Timeout,
    #[error("upload failed: {0}")]
    Transport(String),
    #[error("storage rejected upload with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<BlobError> for FulfillmentError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::Timeout => Self::Timeout(e.to_string()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path`, overwriting, and returns the public URL.
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError>;
}

/// Supabase-compatible storage REST API.
pub struct HttpBlobStore {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, service_key: impl Into<String>, bucket: impl Into<String>, timeout: Duration) -> Result<Self, BlobError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlobError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        })
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, self.bucket, path)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { BlobError::Timeout } else { BlobError::Transport(e.to_string()) })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BlobError::Rejected { status: status.as_u16(), body });
        }
        Ok(self.public_url(path))
    }
}

/// In-process object store for tests and local runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self { Self::default() }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError> {
        self.objects.lock().await.insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{path}"))
    }
}
