//! Run abstraction: the business logic behind a task.

use crate::context::RunContext;
use async_trait::async_trait;
use relay_correlator::CorrelatorError;
use relay_events::EventError;
use relay_memory::FetchError;
use serde_json::Value;
use thiserror::Error;

/// Errors a run can fail with. Each one ends the run with `RUN_ERROR`.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0}")]
    Failed(String),

    #[error("Failed to load conversation: {0}")]
    Fetch(#[from] FetchError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Correlation error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("There is no tool call id in the message history")]
    MissingToolCall,
}

/// Result of a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Attached to `RUN_FINISHED` as its raw event.
    pub result: Option<Value>,
}

impl RunOutcome {
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
        }
    }
}

/// A named, resumable computation driven by the orchestrator.
#[async_trait]
pub trait Run: Send + Sync {
    fn name(&self) -> &str;

    /// Non-interactive runs only emit run-level events.
    fn interactive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome, RunError>;
}
