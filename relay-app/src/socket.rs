//! Socket.IO connection to the runtime service.
//!
//! The client runs its callbacks on its own thread. Outbound run events
//! reach it through the event sink thread; inbound client responses are
//! handed straight to the correlator.

use parking_lot::{Condvar, Mutex};
use relay_correlator::ResponseCorrelator;
use relay_events::{SinkError, Transport};
use relay_runtime::{route_client_payload, RuntimeConfig, CLIENT_RESPONSE_EVENT, JOIN_EVENT};
use rust_socketio::client::Client;
use rust_socketio::{ClientBuilder, Event, Payload, RawClient};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct ConnectionState {
    connected: Mutex<bool>,
    changed: Condvar,
}

impl ConnectionState {
    fn set(&self, connected: bool) {
        *self.connected.lock() = connected;
        self.changed.notify_all();
    }
}

/// Live socket plus its connection state.
pub struct RuntimeSocket {
    client: Client,
    state: Arc<ConnectionState>,
}

impl RuntimeSocket {
    /// Connect and register the runtime's event handlers.
    ///
    /// On every (re)connect the runtime joins its namespace space.
    pub fn connect(config: &RuntimeConfig, correlator: ResponseCorrelator) -> anyhow::Result<Self> {
        let state = Arc::new(ConnectionState::default());
        let join = config.join_payload();
        let socket = &config.socket;

        let on_connect = {
            let state = Arc::clone(&state);
            move |_payload: Payload, client: RawClient| {
                info!("Connected to runtime socket");
                state.set(true);
                if let Err(e) = client.emit(JOIN_EVENT, join.clone()) {
                    error!("Failed to join agent space: {}", e);
                }
            }
        };

        let on_close = {
            let state = Arc::clone(&state);
            move |_payload: Payload, _client: RawClient| {
                warn!("Disconnected from runtime socket");
                state.set(false);
            }
        };

        let on_client_response = move |payload: Payload, _client: RawClient| {
            match first_value(payload) {
                Some(value) => {
                    if !route_client_payload(&correlator, value) {
                        debug!("Client response had no waiting run");
                    }
                }
                None => warn!("Ignoring empty client response"),
            }
        };

        let client = ClientBuilder::new(config.socket_url())
            .reconnect(socket.reconnection)
            .max_reconnect_attempts(u8::try_from(socket.reconnection_attempts).unwrap_or(u8::MAX))
            .reconnect_delay(
                socket.reconnection_delay_secs * 1000,
                socket.reconnection_delay_max_secs * 1000,
            )
            .on(Event::Connect, on_connect)
            .on(Event::Close, on_close)
            .on(Event::Error, |payload: Payload, _client: RawClient| {
                error!("Socket error: {:?}", payload);
            })
            .on(CLIENT_RESPONSE_EVENT, on_client_response)
            .connect()
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", config.socket_url(), e))?;

        Ok(Self { client, state })
    }

    /// Block until connected or `timeout` elapses.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut connected = self.state.connected.lock();
        while !*connected {
            if self
                .state
                .changed
                .wait_until(&mut connected, deadline)
                .timed_out()
            {
                return *connected;
            }
        }
        true
    }

    /// Transport for the event sink thread.
    pub fn transport(&self) -> SocketTransport {
        SocketTransport {
            client: self.client.clone(),
        }
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.client.disconnect() {
            warn!("Socket disconnect failed: {}", e);
        }
    }
}

pub struct SocketTransport {
    client: Client,
}

impl Transport for SocketTransport {
    fn emit(&mut self, event: &str, data: Value) -> Result<(), SinkError> {
        self.client
            .emit(event, data)
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}

#[allow(deprecated)]
fn first_value(payload: Payload) -> Option<Value> {
    match payload {
        Payload::Text(values) => values.into_iter().next(),
        Payload::String(text) => serde_json::from_str(&text).ok(),
        Payload::Binary(_) => None,
    }
}
