use thiserror::Error;

/// Broker and consumer errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected. Call connect() first")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Failed to settle delivery: {0}")]
    Settle(String),
}
