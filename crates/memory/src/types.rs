use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Message as stored by the remote runtime service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMessage {
    pub id: String,
    pub thread: String,
    #[serde(default)]
    pub content: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

pub const ROLE_USER: &str = "user";
pub const ROLE_AGENT: &str = "agent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Message in a cached conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationMessage {
    Human {
        #[serde(default)]
        id: Option<String>,
        content: String,
    },
    Ai {
        #[serde(default)]
        id: Option<String>,
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
        status: ToolStatus,
    },
}

impl ConversationMessage {
    pub fn human(content: impl Into<String>) -> Self {
        Self::Human {
            id: None,
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::Ai {
            id: None,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Ai {
            id: None,
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>, status: ToolStatus) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            status,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Human { content, .. } | Self::Ai { content, .. } | Self::Tool { content, .. } => {
                content
            }
        }
    }

    /// Tool calls requested by an AI message. Empty for other kinds.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Convert stored runtime messages into conversation messages.
///
/// An agent message carrying a tool call expands into the AI request and,
/// when results were recorded, the matching tool reply. Unknown roles are
/// skipped.
pub fn convert_messages(messages: Vec<RuntimeMessage>) -> Vec<ConversationMessage> {
    let mut converted = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role.as_str() {
            ROLE_USER => converted.push(ConversationMessage::Human {
                id: Some(message.id),
                content: message.content,
            }),
            ROLE_AGENT => match message.tool_call_id.filter(|id| !id.is_empty()) {
                Some(tool_call_id) => {
                    converted.push(ConversationMessage::Ai {
                        id: Some(message.id),
                        content: message.content,
                        tool_calls: vec![ToolCall {
                            id: tool_call_id.clone(),
                            name: message.tool_name.unwrap_or_default(),
                            args: message.tool_input.unwrap_or(Value::Null),
                        }],
                    });

                    if let Some(results) = message.tool_results {
                        let status = if message.tool_status.as_ref().is_some_and(is_truthy) {
                            ToolStatus::Success
                        } else {
                            ToolStatus::Error
                        };
                        converted.push(ConversationMessage::Tool {
                            tool_call_id,
                            content: results.to_string(),
                            status,
                        });
                    }
                }
                None => converted.push(ConversationMessage::Ai {
                    id: Some(message.id),
                    content: message.content,
                    tool_calls: Vec::new(),
                }),
            },
            other => warn!("Skipping message {} with unknown role: {}", message.id, other),
        }
    }

    converted
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: Value) -> RuntimeMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_user_and_agent_messages() {
        let messages = vec![
            wire(json!({"id": "1", "thread": "t", "content": "hi", "role": "user"})),
            wire(json!({"id": "2", "thread": "t", "content": "hello", "role": "agent"})),
        ];

        let converted = convert_messages(messages);
        assert_eq!(converted.len(), 2);
        assert!(matches!(&converted[0], ConversationMessage::Human { content, .. } if content == "hi"));
        assert!(matches!(&converted[1], ConversationMessage::Ai { tool_calls, .. } if tool_calls.is_empty()));
    }

    #[test]
    fn test_tool_call_with_results_expands() {
        let messages = vec![wire(json!({
            "id": "3",
            "thread": "t",
            "content": "",
            "role": "agent",
            "toolCallId": "call_1",
            "toolName": "search",
            "toolInput": {"q": "rust"},
            "toolResults": {"hits": 2},
            "toolStatus": "success"
        }))];

        let converted = convert_messages(messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(
            converted[0].tool_calls(),
            &[ToolCall {
                id: "call_1".to_string(),
                name: "search".to_string(),
                args: json!({"q": "rust"}),
            }]
        );
        assert_eq!(
            converted[1],
            ConversationMessage::tool("call_1", r#"{"hits":2}"#, ToolStatus::Success)
        );
    }

    #[test]
    fn test_tool_call_without_status_is_error() {
        let messages = vec![wire(json!({
            "id": "3",
            "thread": "t",
            "role": "agent",
            "toolCallId": "call_1",
            "toolName": "search",
            "toolResults": "boom"
        }))];

        let converted = convert_messages(messages);
        assert!(matches!(
            &converted[1],
            ConversationMessage::Tool { status: ToolStatus::Error, .. }
        ));
    }

    #[test]
    fn test_pending_tool_call_has_no_reply() {
        let messages = vec![wire(json!({
            "id": "4",
            "thread": "t",
            "role": "agent",
            "toolCallId": "call_2",
            "toolName": "confirm"
        }))];

        let converted = convert_messages(messages);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].tool_calls()[0].args, Value::Null);
    }

    #[test]
    fn test_unknown_role_skipped() {
        let messages = vec![
            wire(json!({"id": "1", "thread": "t", "content": "x", "role": "system"})),
            wire(json!({"id": "2", "thread": "t", "content": "y", "role": "user"})),
        ];

        let converted = convert_messages(messages);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].content(), "y");
    }
}
