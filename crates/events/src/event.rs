//! Run event model and the envelope shipped to the real-time channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code carried by a `RUN_ERROR` event when a run fails.
pub const TASK_FAILED: &str = "TASK_FAILED";

/// One event of a run, serialized with camelCase keys and an
/// upper-snake-case `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        thread_id: String,
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_event: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished {
        thread_id: String,
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_event: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    RunError {
        message: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_event: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    TextMessageStart { message_id: String, role: String },
    #[serde(rename_all = "camelCase")]
    TextMessageContent { message_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    TextMessageEnd {
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_event: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallArgs { tool_call_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call_id: String },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        message_id: String,
        tool_call_id: String,
        content: Value,
    },
    Custom { name: String, value: Value },
}

impl AgentEvent {
    /// Wire name of the event kind, e.g. `RUN_STARTED`.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::RunStarted { .. } => "RUN_STARTED",
            AgentEvent::RunFinished { .. } => "RUN_FINISHED",
            AgentEvent::RunError { .. } => "RUN_ERROR",
            AgentEvent::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            AgentEvent::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            AgentEvent::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            AgentEvent::ToolCallStart { .. } => "TOOL_CALL_START",
            AgentEvent::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            AgentEvent::ToolCallEnd { .. } => "TOOL_CALL_END",
            AgentEvent::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            AgentEvent::Custom { .. } => "CUSTOM",
        }
    }

    /// Terminal events close a run; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::RunFinished { .. } | AgentEvent::RunError { .. }
        )
    }

    /// Run-level events are never affected by streaming suppression.
    pub fn is_run_level(&self) -> bool {
        matches!(self, AgentEvent::RunStarted { .. }) || self.is_terminal()
    }
}

/// Envelope delivered to the real-time channel.
///
/// `session_id` is the id of the run that produced the event and `order`
/// is its per-run sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub thread_id: String,
    pub session_id: String,
    pub event: AgentEvent,
    pub order: u64,
}
