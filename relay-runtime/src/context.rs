use crate::metrics::{increment_correlator_timeouts, MetricTimer};
use crate::run::RunError;
use relay_correlator::{Reply, ResponseCorrelator};
use relay_events::OrderedEventEmitter;
use relay_memory::{ConversationCache, ConversationMessage};
use relay_queue::Task;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Everything one run invocation may touch.
///
/// Built fresh per task by the orchestrator; the emitter inside starts at
/// sequence 0.
pub struct RunContext {
    task: Task,
    emitter: OrderedEventEmitter,
    cache: Arc<ConversationCache>,
    correlator: ResponseCorrelator,
    client_response_timeout: Duration,
}

impl RunContext {
    pub fn new(
        task: Task,
        emitter: OrderedEventEmitter,
        cache: Arc<ConversationCache>,
        correlator: ResponseCorrelator,
        client_response_timeout: Duration,
    ) -> Self {
        Self {
            task,
            emitter,
            cache,
            correlator,
            client_response_timeout,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn thread_id(&self) -> &str {
        self.task.thread_id()
    }

    pub fn run_id(&self) -> &str {
        self.emitter.run_id()
    }

    /// Content of the message that triggered the task.
    pub fn input(&self) -> &str {
        &self.task.message.content
    }

    pub fn config(&self) -> &Value {
        &self.task.config
    }

    pub fn emitter(&self) -> &OrderedEventEmitter {
        &self.emitter
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    /// Conversation so far, loaded from history on first access.
    pub async fn messages(&self) -> Result<Vec<ConversationMessage>, RunError> {
        Ok(self.cache.get(self.thread_id()).await?)
    }

    pub fn append_message(&self, message: ConversationMessage) {
        self.cache.append(self.thread_id(), message);
    }

    /// Suspend until the client answers `tool_call_id`.
    ///
    /// A timeout yields the timeout sentinel rather than an error.
    pub async fn wait_for_client_response(&self, tool_call_id: &str) -> Result<Value, RunError> {
        let reply = {
            let _timer = MetricTimer::new("correlator_wait_duration");
            self.correlator
                .wait(tool_call_id, self.client_response_timeout)
                .await?
        };

        if let Reply::TimedOut = reply {
            warn!(
                "No client response for tool call {} in run {}",
                tool_call_id,
                self.run_id()
            );
            increment_correlator_timeouts();
        }
        Ok(reply.into_value())
    }
}
