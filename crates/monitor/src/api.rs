//! REST client for the execution status endpoint.
//!
//! The poller reads execution state through the [`StatusSource`] trait;
//! [`ExecutionApi`] implements it with [`reqwest`] against
//! `GET {api_url}/executions/{execution_id}`.

use async_trait::async_trait;
use serde::Deserialize;

use flowwatch_core::types::Timestamp;

use crate::messages::LogEntry;

/// Execution state as returned by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecutionSnapshot {
    #[serde(default, alias = "execution_id")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// Node id -> node state payload.
    #[serde(default)]
    pub node_states: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Errors from the status endpoint layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint returned a non-2xx status code.
    #[error("Status endpoint error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body as returned by the server.
        body: String,
    },
}

/// Read-only source of execution state.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot, ApiError>;
}

/// HTTP client for the execution status endpoint.
pub struct ExecutionApi {
    client: reqwest::Client,
    api_url: String,
}

impl ExecutionApi {
    /// Create a client for `api_url`, e.g. `http://host:8000/api`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create a client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Pass 2xx responses through; anything else becomes
    /// [`ApiError::Status`] carrying the body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl StatusSource for ExecutionApi {
    /// Fetch the current state of one execution.
    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot, ApiError> {
        let response = self
            .client
            .get(format!("{}/executions/{}", self.api_url, execution_id))
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.json::<ExecutionSnapshot>().await?)
    }
}
