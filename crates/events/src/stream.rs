//! Streaming chunks produced by a model while a run is generating.

use serde::{Deserialize, Serialize};

/// Finish reason reported when a model stops to call tools.
pub const FINISH_TOOL_CALLS: &str = "tool_calls";

/// Fragment of a tool call streamed inside a token chunk.
///
/// The first fragment of a call carries its `id` and `name`; later
/// fragments only carry argument text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// One streamed token with its optional tool-call fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_call: Option<ToolCallChunk>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl TokenChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn tool_call_begin(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tool_call: Some(ToolCallChunk {
                id: Some(id.into()),
                name: Some(name.into()),
                arguments: String::new(),
            }),
            ..Default::default()
        }
    }

    pub fn tool_call_args(arguments: impl Into<String>) -> Self {
        Self {
            tool_call: Some(ToolCallChunk {
                id: None,
                name: None,
                arguments: arguments.into(),
            }),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn finishes_with_tool_calls(&self) -> bool {
        self.finish_reason.as_deref() == Some(FINISH_TOOL_CALLS)
    }
}
