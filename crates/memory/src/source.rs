//! Remote conversation history.

use crate::types::RuntimeMessage;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const NAMESPACE_HEADER: &str = "x-agent-namespace";
pub const NAMESPACE_SECRET_HEADER: &str = "x-agent-namespace-secret";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("History request failed: {0}")]
    Request(String),

    #[error("History request returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("History service rejected request: {0}")]
    Rejected(String),

    #[error("Malformed history response: {0}")]
    Decode(String),
}

/// Source of stored messages for a thread.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, thread_id: &str, limit: usize) -> Result<Vec<RuntimeMessage>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    success: bool,
    #[serde(default)]
    data: Option<Vec<RuntimeMessage>>,
    #[serde(default)]
    message: Option<String>,
}

/// Fetches thread messages from the runtime service over HTTP.
pub struct HttpHistorySource {
    endpoint: String,
    namespace: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpHistorySource {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build history client, using defaults without timeout: {}", e);
                reqwest::Client::new()
            });

        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            api_key: api_key.into(),
            client,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/agents/get-thread-messages",
            self.endpoint.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch(&self, thread_id: &str, limit: usize) -> Result<Vec<RuntimeMessage>, FetchError> {
        debug!("Fetching up to {} messages for thread {}", limit, thread_id);

        let limit = limit.to_string();
        let response = self
            .client
            .get(self.url())
            .query(&[("threadId", thread_id), ("limit", limit.as_str())])
            .header(NAMESPACE_HEADER, &self.namespace)
            .header(NAMESPACE_SECRET_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Request(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_history(&body)
    }
}

fn parse_history(body: &str) -> Result<Vec<RuntimeMessage>, FetchError> {
    let parsed: HistoryResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    if !parsed.success {
        return Err(FetchError::Rejected(
            parsed.message.unwrap_or_else(|| "Unknown error".to_string()),
        ));
    }

    Ok(parsed.data.unwrap_or_default())
}
