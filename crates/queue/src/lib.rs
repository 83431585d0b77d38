//! Durable task queue consumption with bounded concurrency and retries.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod policy;
pub mod task;

pub use broker::{
    retry_count, with_retry, Broker, Connector, Delivery, DeliveryStream, HeaderValue, Headers,
    RETRY_HEADER,
};
pub use consumer::{BoundedQueueConsumer, ConsumerOptions, HandlerError, TaskHandler};
pub use error::QueueError;
pub use memory::InMemoryBroker;
pub use policy::RetryPolicy;
pub use task::{Task, TaskDecodeError, TaskMessage};
