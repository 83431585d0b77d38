//! Bounded-concurrency consumer with a retry and dead-letter policy.

use crate::broker::{retry_count, with_retry, Broker, Connector, Delivery};
use crate::error::QueueError;
use crate::policy::RetryPolicy;
use crate::task::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Handler failures, split by whether the delivery should come back.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Discard the message.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// Return the message to the queue untouched.
    #[error("Transient: {0}")]
    Transient(String),
}

/// Processes decoded tasks.
///
/// `Ok(true)` settles the task. `Ok(false)` asks for a delayed retry.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task) -> Result<bool, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub max_concurrent_workers: usize,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 2,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Pulls tasks from a durable queue, running at most W handlers at once.
pub struct BoundedQueueConsumer {
    connector: Arc<dyn Connector>,
    options: ConsumerOptions,
    broker: Option<Arc<dyn Broker>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

struct Dispatch {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn TaskHandler>,
    queue: String,
    retry: RetryPolicy,
}

impl BoundedQueueConsumer {
    pub fn new(connector: Arc<dyn Connector>, options: ConsumerOptions) -> Self {
        let workers = options.max_concurrent_workers.max(1);
        Self {
            connector,
            options,
            broker: None,
            permits: Arc::new(Semaphore::new(workers)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Open the broker connection and apply prefetch = W.
    pub async fn connect(&mut self) -> Result<(), QueueError> {
        let broker = tokio::time::timeout(self.options.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                QueueError::Connection(format!(
                    "Timed out after {:?}",
                    self.options.connect_timeout
                ))
            })?
            .map_err(|e| {
                error!("Broker connection failed: {}", e);
                e
            })?;

        let prefetch = u16::try_from(self.worker_limit()).unwrap_or(u16::MAX);
        broker.set_prefetch(prefetch).await?;

        info!("Connected to broker (prefetch={})", prefetch);
        self.broker = Some(broker);
        Ok(())
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), QueueError> {
        self.broker()?.declare_queue(name, durable).await?;
        info!("Queue '{}' declared", name);
        Ok(())
    }

    /// Consume `queue` until shutdown is requested or the broker ends the
    /// stream, then drain in-flight work for at most the grace period.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), QueueError> {
        let broker = self.broker()?;
        broker.declare_queue(queue, true).await?;
        let mut deliveries = broker.consume(queue).await?;

        let dispatch = Arc::new(Dispatch {
            broker,
            handler,
            queue: queue.to_string(),
            retry: self.options.retry,
        });

        info!(
            "Subscribed to queue '{}' with {} concurrent workers",
            queue,
            self.worker_limit()
        );

        let mut result = Ok(());
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Consumer cancelled");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery, Arc::clone(&dispatch)),
                    Some(Err(e)) => {
                        error!("Delivery stream failed: {}", e);
                        result = Err(e);
                        break;
                    }
                    None => {
                        info!("Delivery stream ended");
                        break;
                    }
                },
            }
        }

        self.drain().await;
        result
    }

    /// Stop accepting deliveries, drain in-flight work, close the broker.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.shutdown.cancel();
        self.drain().await;

        if let Some(broker) = &self.broker {
            broker.close().await?;
        }
        info!("Broker connection closed");
        Ok(())
    }

    /// Token that stops [`subscribe`](Self::subscribe) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of handlers currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.worker_limit() - self.permits.available_permits()
    }

    fn worker_limit(&self) -> usize {
        self.options.max_concurrent_workers.max(1)
    }

    fn broker(&self) -> Result<Arc<dyn Broker>, QueueError> {
        self.broker.clone().ok_or(QueueError::NotConnected)
    }

    fn dispatch(&self, delivery: Box<dyn Delivery>, dispatch: Arc<Dispatch>) {
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = shutdown.cancelled() => {
                    debug!("Shutdown before admission, returning delivery to queue");
                    settle(delivery.reject(true).await);
                    return;
                }
            };

            let Ok(_permit) = permit else {
                settle(delivery.reject(true).await);
                return;
            };

            process(delivery, &dispatch).await;
        });
    }

    async fn drain(&self) {
        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }

        info!("Waiting for {} active tasks to complete...", self.tracker.len());
        if tokio::time::timeout(self.options.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} tasks still running after {:?} grace period",
                self.tracker.len(),
                self.options.shutdown_grace
            );
        }
    }
}

async fn process(delivery: Box<dyn Delivery>, dispatch: &Dispatch) {
    let retry = retry_count(delivery.headers());

    if dispatch.retry.exhausted(retry) {
        warn!("Max retries reached ({}). Discarding message", retry);
        settle(delivery.reject(false).await);
        metrics::counter!("tasks_discarded", 1);
        return;
    }

    let task = match Task::decode(delivery.body()) {
        Ok(task) => task,
        Err(e) => {
            warn!("Discarding malformed message: {}", e);
            settle(delivery.reject(false).await);
            metrics::counter!("tasks_discarded", 1);
            return;
        }
    };

    debug!(
        "Processing task: run={}, thread={}, retry={}",
        task.run_name,
        task.thread_id(),
        retry
    );

    // Run the handler on its own task so a panic is reported as a JoinError.
    let handler = Arc::clone(&dispatch.handler);
    let outcome = tokio::spawn(async move { handler.handle(task).await }).await;

    match outcome {
        Ok(Ok(true)) => {
            settle(delivery.ack().await);
            metrics::counter!("tasks_acked", 1);
            debug!("Message processed successfully");
        }
        Ok(Ok(false)) => {
            info!("Message processing failed. Retrying in {:?}", dispatch.retry.backoff);
            // Acked before the re-publish: a crash in between loses the task.
            settle(delivery.ack().await);
            tokio::time::sleep(dispatch.retry.backoff).await;

            let headers = with_retry(delivery.headers(), dispatch.retry.next_retry(retry));
            match dispatch
                .broker
                .publish(&dispatch.queue, delivery.body().to_vec(), headers)
                .await
            {
                Ok(()) => {
                    metrics::counter!("tasks_retried", 1);
                }
                Err(e) => error!("Failed to re-publish task: {}", e),
            }
        }
        Ok(Err(HandlerError::Unrecoverable(reason))) => {
            warn!("Unrecoverable handler error, discarding message: {}", reason);
            settle(delivery.reject(false).await);
            metrics::counter!("tasks_discarded", 1);
        }
        Ok(Err(HandlerError::Transient(reason))) => {
            warn!("Transient handler error, requeueing message: {}", reason);
            settle(delivery.reject(true).await);
            metrics::counter!("tasks_requeued", 1);
        }
        Err(e) => {
            error!("Handler aborted, requeueing message: {}", e);
            settle(delivery.reject(true).await);
            metrics::counter!("tasks_requeued", 1);
        }
    }
}

fn settle(result: Result<(), QueueError>) {
    if let Err(e) = result {
        error!("{}", e);
    }
}
