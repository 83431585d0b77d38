//! Request/response correlation for suspended runs.
//!
//! A run registers a wait under a correlation key (usually a tool call id)
//! and suspends. Another execution context, typically the real-time
//! transport thread, resolves it with [`ResponseCorrelator::signal`].
//! The hand-off goes through a `tokio::sync::oneshot` channel, whose send
//! side is safe to use from any OS thread and wakes the waiting task on
//! its own scheduler.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Correlator errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("A wait is already registered for key: {0}")]
    DuplicateKey(String),

    #[error("Wait for key {0} was abandoned")]
    Abandoned(String),
}

/// Outcome of a wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Received(Value),
    TimedOut,
}

impl Reply {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Reply::TimedOut)
    }

    /// The received value, or the timeout sentinel.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Received(value) => value,
            Reply::TimedOut => timeout_sentinel(),
        }
    }
}

/// Value handed to a run whose wait timed out.
pub fn timeout_sentinel() -> Value {
    json!({"success": false, "reason": "timeout"})
}

struct PendingWait {
    id: u64,
    tx: oneshot::Sender<Value>,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingWait>>,
    next_id: AtomicU64,
}

/// Maps correlation keys to suspended waiters.
///
/// Cheap to clone; clones share the same pending map.
#[derive(Clone)]
pub struct ResponseCorrelator {
    inner: Arc<Inner>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Suspend until `key` is signaled or `timeout` elapses.
    ///
    /// A timeout resolves to [`Reply::TimedOut`]. The registration is removed
    /// before this returns, and also if the returned future is dropped.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Result<Reply, CorrelatorError> {
        let (rx, _registration) = self.register(key)?;
        debug!("Waiting up to {:?} for response: {}", timeout, key);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                debug!("Response received: {}", key);
                Ok(Reply::Received(value))
            }
            Ok(Err(_)) => Err(CorrelatorError::Abandoned(key.to_string())),
            Err(_) => {
                info!("Timed out after {:?} waiting for response: {}", timeout, key);
                Ok(Reply::TimedOut)
            }
        }
    }

    /// Resolve the wait registered under `key`.
    ///
    /// Callable from any thread. Unknown or already resolved keys are
    /// ignored. Returns whether a waiter received the value.
    pub fn signal(&self, key: &str, value: Value) -> bool {
        let Some(pending) = self.inner.pending.lock().remove(key) else {
            debug!("Ignoring response for unknown key: {}", key);
            return false;
        };

        if pending.tx.send(value).is_err() {
            warn!("Waiter for key {} went away before its response arrived", key);
            return false;
        }
        true
    }

    /// Number of outstanding waits.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    fn register(
        &self,
        key: &str,
    ) -> Result<(oneshot::Receiver<Value>, Registration), CorrelatorError> {
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(key) {
            return Err(CorrelatorError::DuplicateKey(key.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(key.to_string(), PendingWait { id, tx });

        Ok((
            rx,
            Registration {
                inner: Arc::clone(&self.inner),
                key: key.to_string(),
                id,
            },
        ))
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its own entry from the pending map when dropped.
///
/// The id check keeps a newer registration under the same key intact.
struct Registration {
    inner: Arc<Inner>,
    key: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        if pending.get(&self.key).map(|p| p.id) == Some(self.id) {
            pending.remove(&self.key);
        }
    }
}
