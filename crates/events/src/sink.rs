//! Outbound sinks for run events.

use crate::event::EventEnvelope;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Socket event name used for run events.
pub const AGUI_EVENT: &str = "agui_event";

/// Sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receiver side of the event stream.
///
/// `send` must not block: it is called while the emitter holds its
/// ordering lock.
pub trait EventSink: Send + Sync {
    fn send(&self, envelope: EventEnvelope) -> Result<(), SinkError>;
}

/// Sink backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, envelope: EventEnvelope) -> Result<(), SinkError> {
        self.tx.send(envelope).map_err(|_| SinkError::Closed)
    }
}

/// Blocking real-time transport, driven from a dedicated thread.
pub trait Transport: Send + 'static {
    fn emit(&mut self, event: &str, data: serde_json::Value) -> Result<(), SinkError>;
}

/// Sink whose transport runs on its own OS thread.
///
/// Envelopes cross into the transport thread through an unbounded channel,
/// so the scheduler never waits on network I/O.
pub struct ThreadedSink {
    inner: ChannelSink,
    handle: JoinHandle<()>,
}

impl ThreadedSink {
    /// Spawn the transport thread.
    pub fn spawn<T: Transport>(mut transport: T) -> Result<Self, SinkError> {
        let (inner, mut rx) = ChannelSink::new();

        let handle = std::thread::Builder::new()
            .name("relay-event-transport".to_string())
            .spawn(move || {
                info!("Event transport thread started");
                while let Some(envelope) = rx.blocking_recv() {
                    let order = envelope.order;
                    let kind = envelope.event.kind();
                    let payload = match serde_json::to_value(&envelope) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Failed to encode {} event: {}", kind, e);
                            continue;
                        }
                    };
                    match transport.emit(AGUI_EVENT, payload) {
                        Ok(()) => debug!("[{}] {} sent for thread {}", order, kind, envelope.thread_id),
                        Err(e) => error!("Failed to send {} event: {}", kind, e),
                    }
                }
                info!("Event transport thread stopped");
            })
            .map_err(|e| SinkError::Transport(format!("Failed to spawn transport thread: {}", e)))?;

        Ok(Self { inner, handle })
    }

    /// Handle for emitters. Clones share the transport thread.
    pub fn sender(&self) -> ChannelSink {
        self.inner.clone()
    }

    /// Close the channel and wait for queued events to be flushed.
    ///
    /// Outstanding `ChannelSink` clones keep the thread alive until dropped.
    pub fn shutdown(self) {
        let Self { inner, handle } = self;
        drop(inner);
        if handle.join().is_err() {
            error!("Event transport thread panicked");
        }
    }
}

impl EventSink for ThreadedSink {
    fn send(&self, envelope: EventEnvelope) -> Result<(), SinkError> {
        self.inner.send(envelope)
    }
}
