use crate::config::ConfigError;
use relay_events::SinkError;
use relay_queue::QueueError;
use thiserror::Error;

/// Runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}
