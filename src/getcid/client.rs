//! HTTP client for the GetCID provider.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::domain::aggregates::TokenUsage;
use crate::domain::value_objects::InstallationId;
use crate::FulfillmentError;

pub const DEFAULT_BASE_URL: &str = "https://getcid.info";
const DEFAULT_CAPACITY: f64 = 100.0;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("provider response unreadable: {0}")]
    Decode(String),
    #[error("token verification failed")]
    Rejected,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { Self::Timeout } else if e.is_decode() { Self::Decode(e.to_string()) } else { Self::Transport(e.to_string()) }
    }
}

impl From<ProviderError> for FulfillmentError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout => Self::Timeout("confirmation id provider".into()),
            ProviderError::Rejected => Self::Validation("Invalid token - verification failed".into()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CidProvider: Send + Sync {
    /// Raw text answer for an installation id.
    async fn confirmation_id(&self, iid: &InstallationId, token: &str) -> Result<String, ProviderError>;

    /// Usage and capacity from the provider's own ledger.
    async fn verify_token(&self, token: &str) -> Result<TokenUsage, ProviderError>;
}

pub struct GetCidClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VerifyResponse {
    status: Option<String>,
    result: Option<VerifyResult>,
}

#[derive(Deserialize)]
struct VerifyResult {
    email: Option<String>,
    count_token: Option<f64>,
    total_token: Option<f64>,
}

impl GetCidClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl CidProvider for GetCidClient {
    async fn confirmation_id(&self, iid: &InstallationId, token: &str) -> Result<String, ProviderError> {
        let url = format!("{}/api/{}/{}", self.base_url, iid, token);
        let resp = self.http.get(&url).send().await?;
        if resp.status().is_server_error() {
            return Err(ProviderError::Status(resp.status().as_u16()));
        }
        Ok(resp.text().await?.trim().to_string())
    }

    async fn verify_token(&self, token: &str) -> Result<TokenUsage, ProviderError> {
        let url = format!("{}/verify-api-token-getcid", self.base_url);
        let resp = self.http.post(&url).form(&[("tokenApi", token)]).send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Status(resp.status().as_u16()));
        }
        let body: VerifyResponse = resp.json().await?;
        match (body.status.as_deref(), body.result) {
            (Some("Success"), Some(r)) => Ok(TokenUsage {
                email: r.email,
                count_used: r.count_token.unwrap_or(0.0).floor() as i32,
                total_available: r.total_token.unwrap_or(DEFAULT_CAPACITY).floor() as i32,
            }),
            _ => Err(ProviderError::Rejected),
        }
    }
}
