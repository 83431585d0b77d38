//! Runs shipped with the binary.

use async_trait::async_trait;
use relay_events::TokenChunk;
use relay_memory::ConversationMessage;
use relay_runtime::{Run, RunContext, RunError, RunOutcome, RunRegistry};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Streams the latest user message back one word at a time.
pub struct EchoRun;

#[async_trait]
impl Run for EchoRun {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome, RunError> {
        let messages = ctx.messages().await?;
        let text = messages
            .iter()
            .rev()
            .find(|m| matches!(m, ConversationMessage::Human { .. }))
            .map(|m| m.content().to_string())
            .unwrap_or_else(|| ctx.input().to_string());

        let message_id = Uuid::new_v4().to_string();
        let emitter = ctx.emitter();
        emitter.message_start(&message_id)?;

        let mut words = text.split_whitespace().peekable();
        while let Some(word) = words.next() {
            let delta = if words.peek().is_some() {
                format!("{} ", word)
            } else {
                word.to_string()
            };
            emitter.token(&message_id, &TokenChunk::text(delta))?;
        }
        emitter.message_end(&message_id, None)?;

        ctx.append_message(ConversationMessage::ai(text.clone()));
        Ok(RunOutcome::with_result(json!({ "echoed": text })))
    }
}

/// Registry with every builtin run.
pub fn builtin() -> RunRegistry {
    RunRegistry::new().with(Arc::new(EchoRun))
}
