use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskDecodeError {
    #[error("Body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Body is not a valid task: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message that triggered a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    #[serde(rename = "thread")]
    pub thread_id: String,
    pub content: String,
    pub role: String,
}

/// Unit of work pulled from the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub namespace: String,
    #[serde(rename = "agentName")]
    pub run_name: String,
    pub sent_at: String,
    pub message: TaskMessage,
    #[serde(default)]
    pub config: Value,
}

impl Task {
    pub fn decode(body: &[u8]) -> Result<Self, TaskDecodeError> {
        let text = std::str::from_utf8(body)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn thread_id(&self) -> &str {
        &self.message.thread_id
    }

    /// Time spent between publication and now, if `sent_at` is RFC 3339.
    pub fn queue_latency(&self) -> Option<Duration> {
        let sent = DateTime::parse_from_rfc3339(&self.sent_at).ok()?;
        (Utc::now() - sent.with_timezone(&Utc)).to_std().ok()
    }
}
