//! Task to run dispatch.

use crate::context::RunContext;
use crate::metrics::{record_queue_latency, MetricTimer};
use crate::registry::RunRegistry;
use crate::run::RunError;
use async_trait::async_trait;
use futures_util::FutureExt;
use relay_correlator::ResponseCorrelator;
use relay_events::{EventSink, OrderedEventEmitter, TASK_FAILED};
use relay_memory::ConversationCache;
use relay_queue::{HandlerError, Task, TaskHandler};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resolves a task's run, drives it and reports the outcome to the consumer.
pub struct RunOrchestrator {
    registry: Arc<RunRegistry>,
    cache: Arc<ConversationCache>,
    correlator: ResponseCorrelator,
    sink: Arc<dyn EventSink>,
    client_response_timeout: Duration,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<RunRegistry>,
        cache: Arc<ConversationCache>,
        correlator: ResponseCorrelator,
        sink: Arc<dyn EventSink>,
        client_response_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            correlator,
            sink,
            client_response_timeout,
        }
    }

    /// Run one task.
    ///
    /// Returns `Ok(true)` when the run finished and `Ok(false)` when it
    /// failed or panicked and should be retried. Unknown runs are
    /// unrecoverable; a sink that refuses `RUN_STARTED` is transient.
    pub async fn run_task(&self, task: Task) -> Result<bool, HandlerError> {
        let run = self.registry.get(&task.run_name).map_err(|e| {
            warn!("{}", e);
            HandlerError::Unrecoverable(e.to_string())
        })?;

        if let Some(latency) = task.queue_latency() {
            record_queue_latency(latency.as_secs_f64() * 1000.0);
        }

        let thread_id = task.thread_id().to_string();
        let run_id = Uuid::new_v4().to_string();
        let mut emitter = OrderedEventEmitter::new(&thread_id, &run_id, Arc::clone(&self.sink));
        if !run.interactive() {
            emitter = emitter.non_interactive();
        }

        let ctx = RunContext::new(
            task,
            emitter,
            Arc::clone(&self.cache),
            self.correlator.clone(),
            self.client_response_timeout,
        );

        info!(
            "Starting run {} ({}) for thread {}",
            run.name(),
            run_id,
            thread_id
        );
        let _timer = MetricTimer::new("run_duration");

        ctx.emitter().run_started(None).map_err(|e| {
            error!("Failed to start run {}: {}", run_id, e);
            HandlerError::Transient(e.to_string())
        })?;

        // A panicking run fails like any other so the retry cap still applies.
        let result = match AssertUnwindSafe(run.execute(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(RunError::Failed(format!(
                "Run panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        let (succeeded, terminal) = match result {
            Ok(outcome) => {
                info!("Run {} finished", run_id);
                (true, ctx.emitter().run_finished(outcome.result))
            }
            Err(e) => {
                error!("Run {} failed: {}", run_id, e);
                (false, ctx.emitter().run_error(e.to_string(), TASK_FAILED))
            }
        };

        // Keep the cache when no terminal event went out.
        match terminal {
            Ok(_) => {
                self.cache.clear(&thread_id);
                debug!("Cleared cache for thread {}", thread_id);
            }
            Err(e) => error!(
                "Failed to emit terminal event for run {}, keeping cache for thread {}: {}",
                run_id, thread_id, e
            ),
        }
        Ok(succeeded)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[async_trait]
impl TaskHandler for RunOrchestrator {
    async fn handle(&self, task: Task) -> Result<bool, HandlerError> {
        self.run_task(task).await
    }
}
