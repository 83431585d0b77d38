//! Process-wide runtime context.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::orchestrator::RunOrchestrator;
use crate::registry::RunRegistry;
use relay_correlator::ResponseCorrelator;
use relay_events::EventSink;
use relay_memory::{ConversationCache, HistorySource};
use relay_queue::{BoundedQueueConsumer, Connector};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Socket event carrying a client's answer to a tool call.
pub const CLIENT_RESPONSE_EVENT: &str = "client_response";

/// Socket event announcing this runtime to its namespace.
pub const JOIN_EVENT: &str = "join_agent_space";

/// Client answer to a suspended tool call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub tool_call_id: String,
    #[serde(default)]
    pub response: Value,
}

/// Decode a raw [`CLIENT_RESPONSE_EVENT`] payload and signal its waiter.
pub fn route_client_payload(correlator: &ResponseCorrelator, payload: Value) -> bool {
    match serde_json::from_value::<ClientResponse>(payload) {
        Ok(response) => {
            debug!("Client response for tool call {}", response.tool_call_id);
            correlator.signal(&response.tool_call_id, response.response)
        }
        Err(e) => {
            warn!("Ignoring malformed client response: {}", e);
            false
        }
    }
}

/// Owns the state shared by all runs: cache, correlator and orchestrator.
pub struct Runtime {
    config: RuntimeConfig,
    cache: Arc<ConversationCache>,
    correlator: ResponseCorrelator,
    orchestrator: Arc<RunOrchestrator>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        registry: RunRegistry,
        history: Arc<dyn HistorySource>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_correlator(config, registry, history, sink, ResponseCorrelator::new())
    }

    /// Build around an existing correlator, for transports wired up before
    /// the runtime exists.
    pub fn with_correlator(
        config: RuntimeConfig,
        registry: RunRegistry,
        history: Arc<dyn HistorySource>,
        sink: Arc<dyn EventSink>,
        correlator: ResponseCorrelator,
    ) -> Self {
        let cache = Arc::new(ConversationCache::new(history, config.history_limit));
        let orchestrator = Arc::new(RunOrchestrator::new(
            Arc::new(registry),
            Arc::clone(&cache),
            correlator.clone(),
            sink,
            config.client_response_timeout(),
        ));

        Self {
            config,
            cache,
            correlator,
            orchestrator,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue_name(&self) -> String {
        self.config.queue_name()
    }

    pub fn orchestrator(&self) -> Arc<RunOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn cache(&self) -> &Arc<ConversationCache> {
        &self.cache
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    /// Payload for [`JOIN_EVENT`].
    pub fn join_payload(&self) -> Value {
        self.config.join_payload()
    }

    /// Route a client answer to the waiting run. Safe to call from the
    /// transport thread.
    pub fn handle_client_response(&self, response: ClientResponse) -> bool {
        debug!("Client response for tool call {}", response.tool_call_id);
        self.correlator
            .signal(&response.tool_call_id, response.response)
    }

    /// Decode and route a raw [`CLIENT_RESPONSE_EVENT`] payload.
    pub fn handle_client_payload(&self, payload: Value) -> bool {
        route_client_payload(&self.correlator, payload)
    }

    /// Consumer configured from the runtime settings.
    pub fn consumer(&self, connector: Arc<dyn Connector>) -> BoundedQueueConsumer {
        BoundedQueueConsumer::new(connector, self.config.consumer_options())
    }

    /// Connect, declare the task queue and process tasks until the
    /// consumer's shutdown token is cancelled.
    pub async fn serve(&self, consumer: &mut BoundedQueueConsumer) -> Result<(), RuntimeError> {
        let queue = self.queue_name();
        consumer.connect().await?;
        consumer.declare_queue(&queue, true).await?;

        info!(
            "Serving namespace {} with {} workers",
            self.config.namespace, self.config.max_concurrent_workers
        );
        consumer.subscribe(&queue, self.orchestrator()).await?;
        Ok(())
    }

    pub async fn shutdown(&self, consumer: &BoundedQueueConsumer) -> Result<(), RuntimeError> {
        consumer.close().await?;
        if self.correlator.pending() > 0 {
            warn!(
                "{} client responses still pending at shutdown",
                self.correlator.pending()
            );
        }
        info!("Runtime stopped");
        Ok(())
    }
}
