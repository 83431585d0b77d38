//! Tool execution for runs whose model requested tool calls.

use crate::context::RunContext;
use crate::run::RunError;
use async_trait::async_trait;
use relay_memory::{ConversationMessage, ToolCall, ToolStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A tool the run can execute.
#[async_trait]
pub trait ToolStep: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, call: &ToolCall, ctx: &RunContext) -> Result<Value, RunError>;
}

/// Tools by name.
#[derive(Default, Clone)]
pub struct ToolSet {
    steps: HashMap<String, Arc<dyn ToolStep>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, step: Arc<dyn ToolStep>) -> Self {
        self.steps.insert(step.name().to_string(), step);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolStep>> {
        self.steps.get(name)
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub status: ToolStatus,
    pub content: Value,
}

/// Execute the tool calls requested by the last message of the thread.
///
/// Each call reports `TOOL_CALL_RESULT` on success or `TOOL_CALL_END` on
/// failure, and its reply is appended to the cached conversation. Tool
/// failures are returned as error outputs and do not fail the run.
pub async fn run_tool_calls(ctx: &RunContext, tools: &ToolSet) -> Result<Vec<ToolOutput>, RunError> {
    let messages = ctx.messages().await?;
    let calls = match messages.last() {
        Some(last) if last.tool_calls().first().is_some_and(|call| !call.id.is_empty()) => {
            last.tool_calls().to_vec()
        }
        _ => return Err(RunError::MissingToolCall),
    };

    let mut outputs = Vec::with_capacity(calls.len());
    for call in &calls {
        debug!("Invoking tool {} ({})", call.name, call.id);

        let result = match tools.get(&call.name) {
            Some(step) => step.invoke(call, ctx).await,
            None => Err(RunError::Failed(format!("Unknown tool: {}", call.name))),
        };

        let output = match result {
            Ok(content) => {
                ctx.emitter().tool_result(Some(&call.id), content.clone())?;
                ToolOutput {
                    tool_call_id: call.id.clone(),
                    status: ToolStatus::Success,
                    content,
                }
            }
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                ctx.emitter().tool_error(Some(&call.id))?;
                ToolOutput {
                    tool_call_id: call.id.clone(),
                    status: ToolStatus::Error,
                    content: json!({"error": e.to_string()}),
                }
            }
        };

        ctx.append_message(ConversationMessage::tool(
            call.id.clone(),
            tool_content(&output.content),
            output.status,
        ));
        outputs.push(output);
    }

    Ok(outputs)
}

fn tool_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tool executed by the remote client.
///
/// The run suspends until the client answers with the tool call id, or
/// until the client response timeout yields the timeout sentinel.
pub struct ClientTool {
    name: String,
}

impl ClientTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ToolStep for ClientTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &ToolCall, ctx: &RunContext) -> Result<Value, RunError> {
        ctx.wait_for_client_response(&call.id).await
    }
}
