//! Broker abstraction used by the consumer.
//!
//! Implemented by the AMQP adapter in the binary and by
//! [`crate::memory::InMemoryBroker`].

use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header carrying the number of times a task was re-published.
pub const RETRY_HEADER: &str = "x-retry";

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Retry counter from `headers`.
///
/// Integers and numeric strings are accepted. Missing, negative or
/// unparseable values count as 0.
pub fn retry_count(headers: &Headers) -> u32 {
    match headers.get(RETRY_HEADER) {
        Some(HeaderValue::Int(n)) => u32::try_from(*n).unwrap_or(if *n < 0 { 0 } else { u32::MAX }),
        Some(HeaderValue::Str(s)) => s.trim().parse::<u32>().unwrap_or(0),
        _ => 0,
    }
}

/// Copy of `headers` with the retry counter set to `retry`.
pub fn with_retry(headers: &Headers, retry: u32) -> Headers {
    let mut headers = headers.clone();
    headers.insert(RETRY_HEADER.to_string(), HeaderValue::Int(i64::from(retry)));
    headers
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError>;
}

/// Open channel to the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), QueueError>;

    /// Maximum number of unsettled deliveries handed to this consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, QueueError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the consumer is cancelled by the broker.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, QueueError>>;
}

/// One unsettled message.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    fn headers(&self) -> &Headers;

    async fn ack(&self) -> Result<(), QueueError>;

    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}
