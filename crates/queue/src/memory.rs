//! In-process broker with prefetch accounting and a settlement log.
//!
//! Backs the consumer and end-to-end tests, and can stand in for AMQP
//! when running the runtime locally.

use crate::broker::{Broker, Connector, Delivery, DeliveryStream, Headers};
use crate::error::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Acked { tag: u64, body: Vec<u8> },
    Rejected { tag: u64, body: Vec<u8>, requeue: bool },
}

impl Settlement {
    pub fn body(&self) -> &[u8] {
        match self {
            Settlement::Acked { body, .. } | Settlement::Rejected { body, .. } => body,
        }
    }
}

/// Message published through [`Broker::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

struct Message {
    body: Vec<u8>,
    headers: Headers,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    durable: HashMap<String, bool>,
    prefetch: usize,
    unacked: usize,
    next_tag: u64,
    settlements: Vec<Settlement>,
    published: Vec<Published>,
    closed: bool,
    connect_error: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Broker whose `connect` always fails with `reason`.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        let broker = Self::new();
        broker.shared.state.lock().connect_error = Some(reason.into());
        broker
    }

    /// Enqueue a message as an external producer would.
    pub fn push(&self, queue: &str, body: Vec<u8>, headers: Headers) {
        self.shared
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message { body, headers });
        self.shared.changed.notify_waiters();
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.state.lock().settlements.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.shared.state.lock().published.clone()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.shared.state.lock().durable.get(queue).copied()
    }

    pub fn prefetch(&self) -> usize {
        self.shared.state.lock().prefetch
    }

    pub fn unacked(&self) -> usize {
        self.shared.state.lock().unacked
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Wait until at least `count` settlements are recorded.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.settlements.len() >= count)
            .await
    }

    /// Wait until at least `count` messages were published.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.published.len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&State) -> bool) -> bool {
        let wait = async {
            loop {
                let changed = self.shared.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                if done(&self.shared.state.lock()) {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError> {
        {
            let mut state = self.shared.state.lock();
            if let Some(reason) = &state.connect_error {
                return Err(QueueError::Connection(reason.clone()));
            }
            state.closed = false;
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        state.queues.entry(name.to_string()).or_default();
        state.durable.entry(name.to_string()).or_insert(durable);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.shared.state.lock().prefetch = usize::from(count);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, QueueError> {
        Ok(Box::new(MemoryStream {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
        }))
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueError::Publish("Broker closed".to_string()));
            }
            state.published.push(Published {
                queue: queue.to_string(),
                body: body.clone(),
                headers: headers.clone(),
            });
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Message { body, headers });
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shared.state.lock().closed = true;
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

struct MemoryStream {
    shared: Arc<Shared>,
    queue: String,
}

impl MemoryStream {
    fn try_take(&self) -> Option<Option<MemoryDelivery>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Some(None);
        }
        if state.prefetch > 0 && state.unacked >= state.prefetch {
            return None;
        }

        let message = state.queues.get_mut(&self.queue)?.pop_front()?;
        state.unacked += 1;
        state.next_tag += 1;
        let tag = state.next_tag;
        debug!("Delivering message {} from {}", tag, self.queue);

        Some(Some(MemoryDelivery {
            shared: Arc::clone(&self.shared),
            queue: self.queue.clone(),
            tag,
            body: message.body,
            headers: message.headers,
            settled: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, QueueError>> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(taken) = self.try_take() {
                return taken.map(|delivery| Ok(Box::new(delivery) as Box<dyn Delivery>));
            }
            changed.await;
        }
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    body: Vec<u8>,
    headers: Headers,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle(&self, requeue: Option<bool>) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Settle(format!(
                "Delivery {} already settled",
                self.tag
            )));
        }

        {
            let mut state = self.shared.state.lock();
            state.unacked = state.unacked.saturating_sub(1);
            let body = self.body.clone();
            let settlement = match requeue {
                None => Settlement::Acked { tag: self.tag, body },
                Some(requeue) => Settlement::Rejected {
                    tag: self.tag,
                    body,
                    requeue,
                },
            };
            state.settlements.push(settlement);

            if requeue == Some(true) {
                state
                    .queues
                    .entry(self.queue.clone())
                    .or_default()
                    .push_front(Message {
                        body: self.body.clone(),
                        headers: self.headers.clone(),
                    });
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.settle(None)
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.settle(Some(requeue))
    }
}
