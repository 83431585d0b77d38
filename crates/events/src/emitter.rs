//! Per-run ordered event emission.

use crate::event::{AgentEvent, EventEnvelope};
use crate::sink::{EventSink, SinkError};
use crate::stream::TokenChunk;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Emission errors.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Run {0} has not started")]
    NotStarted(String),

    #[error("Run {0} already started")]
    AlreadyStarted(String),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Finished,
}

struct EmitterState {
    next_order: u64,
    phase: Phase,
    suppressed: usize,
    current_message_id: Option<String>,
    current_tool_call_id: Option<String>,
}

/// Assigns per-run sequence numbers and ships events to a sink.
///
/// Sequence numbers are reserved and handed to the sink under one lock,
/// so the sink observes events in sequence order even when several
/// callbacks emit concurrently.
pub struct OrderedEventEmitter {
    thread_id: String,
    run_id: String,
    interactive: bool,
    sink: Arc<dyn EventSink>,
    state: Mutex<EmitterState>,
}

impl OrderedEventEmitter {
    /// Create an emitter for one run. The sequence counter starts at 0.
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            interactive: true,
            sink,
            state: Mutex::new(EmitterState {
                next_order: 0,
                phase: Phase::Pending,
                suppressed: 0,
                current_message_id: None,
                current_tool_call_id: None,
            }),
        }
    }

    /// Mark the whole run non-interactive: only run-level events go out.
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sequence number the next emitted event will receive.
    pub fn next_order(&self) -> u64 {
        self.state.lock().next_order
    }

    pub fn has_started(&self) -> bool {
        self.state.lock().phase != Phase::Pending
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().phase == Phase::Finished
    }

    pub fn is_streaming_suppressed(&self) -> bool {
        !self.interactive || self.state.lock().suppressed > 0
    }

    /// Suppress streaming events until the returned guard is dropped.
    pub fn suppress_streaming(&self) -> SuppressionGuard<'_> {
        self.state.lock().suppressed += 1;
        SuppressionGuard { emitter: self }
    }

    // Lifecycle events

    pub fn run_started(&self, raw_event: Option<Value>) -> Result<u64, EventError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Pending {
            return Err(EventError::AlreadyStarted(self.run_id.clone()));
        }
        let event = AgentEvent::RunStarted {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            raw_event,
        };
        let order = self.deliver(&mut state, event)?;
        state.phase = Phase::Running;
        Ok(order)
    }

    pub fn run_finished(&self, raw_event: Option<Value>) -> Result<Option<u64>, EventError> {
        let event = AgentEvent::RunFinished {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            raw_event,
        };
        self.emit_terminal(event)
    }

    pub fn run_error(
        &self,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<Option<u64>, EventError> {
        let message = message.into();
        let code = code.into();
        let raw_event = serde_json::json!({
            "message": message.clone(),
            "code": code.clone(),
            "run_id": self.run_id.clone(),
        });
        let event = AgentEvent::RunError {
            message,
            code,
            raw_event: Some(raw_event),
        };
        self.emit_terminal(event)
    }

    // Message events

    pub fn message_start(&self, message_id: &str) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|state| {
            state.current_message_id = Some(message_id.to_string());
            vec![AgentEvent::TextMessageStart {
                message_id: message_id.to_string(),
                role: "assistant".to_string(),
            }]
        })
    }

    /// Emit a content delta. Empty deltas are skipped.
    pub fn content(&self, message_id: &str, delta: &str) -> Result<Option<u64>, EventError> {
        if delta.is_empty() {
            return Ok(None);
        }
        self.emit_streaming(|_| {
            vec![AgentEvent::TextMessageContent {
                message_id: message_id.to_string(),
                delta: delta.to_string(),
            }]
        })
    }

    pub fn message_end(
        &self,
        message_id: &str,
        raw_event: Option<Value>,
    ) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|state| {
            state.current_message_id = None;
            vec![AgentEvent::TextMessageEnd {
                message_id: message_id.to_string(),
                raw_event,
            }]
        })
    }

    /// Close a message whose generation failed.
    pub fn message_error(&self, message_id: &str) -> Result<Option<u64>, EventError> {
        self.message_end(message_id, None)
    }

    /// Translate one streamed token into tool-call or content events.
    pub fn token(&self, message_id: &str, chunk: &TokenChunk) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|state| {
            let mut events = Vec::new();
            if let Some(tool_call) = &chunk.tool_call {
                match &tool_call.id {
                    Some(id) => {
                        state.current_tool_call_id = Some(id.clone());
                        events.push(AgentEvent::ToolCallStart {
                            tool_call_id: id.clone(),
                            tool_call_name: tool_call.name.clone().unwrap_or_default(),
                            parent_message_id: state.current_message_id.clone(),
                        });
                    }
                    None => events.push(AgentEvent::ToolCallArgs {
                        tool_call_id: state.current_tool_call_id.clone().unwrap_or_default(),
                        delta: tool_call.arguments.clone(),
                    }),
                }
                return events;
            }

            if chunk.finishes_with_tool_calls() {
                events.push(AgentEvent::ToolCallEnd {
                    tool_call_id: state.current_tool_call_id.clone().unwrap_or_default(),
                });
            }
            if !chunk.text.is_empty() {
                events.push(AgentEvent::TextMessageContent {
                    message_id: message_id.to_string(),
                    delta: chunk.text.clone(),
                });
            }
            events
        })
    }

    // Tool events

    /// Emit a tool result. Without an explicit id the current tool call is used.
    pub fn tool_result(
        &self,
        tool_call_id: Option<&str>,
        content: Value,
    ) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|state| {
            let tool_call_id = tool_call_id
                .map(str::to_string)
                .or_else(|| state.current_tool_call_id.take())
                .unwrap_or_default();
            state.current_tool_call_id = None;
            vec![AgentEvent::ToolCallResult {
                message_id: state.current_message_id.clone().unwrap_or_default(),
                tool_call_id,
                content,
            }]
        })
    }

    /// Close a tool call whose execution failed.
    pub fn tool_error(&self, tool_call_id: Option<&str>) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|state| {
            let tool_call_id = tool_call_id
                .map(str::to_string)
                .or_else(|| state.current_tool_call_id.take())
                .unwrap_or_default();
            state.current_tool_call_id = None;
            vec![AgentEvent::ToolCallEnd { tool_call_id }]
        })
    }

    pub fn custom(&self, name: &str, value: Value) -> Result<Option<u64>, EventError> {
        self.emit_streaming(|_| {
            vec![AgentEvent::Custom {
                name: name.to_string(),
                value,
            }]
        })
    }

    fn emit_terminal(&self, event: AgentEvent) -> Result<Option<u64>, EventError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Pending => return Err(EventError::NotStarted(self.run_id.clone())),
            Phase::Finished => {
                warn!(
                    "Dropping {} for run {}: run already terminated",
                    event.kind(),
                    self.run_id
                );
                return Ok(None);
            }
            Phase::Running => {}
        }
        let order = self.deliver(&mut state, event)?;
        state.phase = Phase::Finished;
        Ok(Some(order))
    }

    /// Returns the order of the last emitted event, or `None` when
    /// nothing was emitted.
    fn emit_streaming<F>(&self, build: F) -> Result<Option<u64>, EventError>
    where
        F: FnOnce(&mut EmitterState) -> Vec<AgentEvent>,
    {
        let mut state = self.state.lock();
        if !self.interactive || state.suppressed > 0 {
            return Ok(None);
        }
        match state.phase {
            Phase::Pending => return Err(EventError::NotStarted(self.run_id.clone())),
            Phase::Finished => {
                warn!("Dropping event for run {}: run already terminated", self.run_id);
                return Ok(None);
            }
            Phase::Running => {}
        }

        let mut last = None;
        for event in build(&mut *state) {
            last = Some(self.deliver(&mut state, event)?);
        }
        Ok(last)
    }

    fn deliver(&self, state: &mut EmitterState, event: AgentEvent) -> Result<u64, EventError> {
        let order = state.next_order;
        debug!("[{} - {}] {} #{}", event.kind(), self.thread_id, self.run_id, order);
        self.sink.send(EventEnvelope {
            thread_id: self.thread_id.clone(),
            session_id: self.run_id.clone(),
            event,
            order,
        })?;
        state.next_order += 1;
        Ok(order)
    }
}

/// Lifts one level of streaming suppression when dropped.
pub struct SuppressionGuard<'a> {
    emitter: &'a OrderedEventEmitter,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.emitter.state.lock();
        state.suppressed = state.suppressed.saturating_sub(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use crate::stream::{TokenChunk, FINISH_TOOL_CALLS};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn emitter() -> (OrderedEventEmitter, UnboundedReceiver<EventEnvelope>) {
        let (sink, rx) = ChannelSink::new();
        (OrderedEventEmitter::new("t1", "r1", Arc::new(sink)), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<EventEnvelope>) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_run_lifecycle_orders() {
        let (emitter, mut rx) = emitter();
        assert_eq!(emitter.run_started(None).unwrap(), 0);
        assert_eq!(emitter.message_start("m1").unwrap(), Some(1));
        assert_eq!(emitter.content("m1", "Hel").unwrap(), Some(2));
        assert_eq!(emitter.content("m1", "lo").unwrap(), Some(3));
        assert_eq!(emitter.message_end("m1", None).unwrap(), Some(4));
        assert_eq!(emitter.run_finished(None).unwrap(), Some(5));

        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "RUN_STARTED",
                "TEXT_MESSAGE_START",
                "TEXT_MESSAGE_CONTENT",
                "TEXT_MESSAGE_CONTENT",
                "TEXT_MESSAGE_END",
                "RUN_FINISHED"
            ]
        );
    }

    #[test]
    fn test_events_before_start_rejected() {
        let (emitter, _rx) = emitter();
        assert!(matches!(
            emitter.message_start("m1"),
            Err(EventError::NotStarted(_))
        ));
        assert!(matches!(
            emitter.run_finished(None),
            Err(EventError::NotStarted(_))
        ));
        assert_eq!(emitter.next_order(), 0);
    }

    #[test]
    fn test_double_start_rejected() {
        let (emitter, _rx) = emitter();
        emitter.run_started(None).unwrap();
        assert!(matches!(
            emitter.run_started(None),
            Err(EventError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn test_nothing_after_terminal() {
        let (emitter, mut rx) = emitter();
        emitter.run_started(None).unwrap();
        emitter.run_error("boom", "TASK_FAILED").unwrap();
        assert_eq!(emitter.run_finished(None).unwrap(), None);
        assert_eq!(emitter.custom("late", json!(1)).unwrap(), None);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[1].event.is_terminal());
        assert!(emitter.is_finished());
    }

    #[test]
    fn test_empty_content_skipped() {
        let (emitter, mut rx) = emitter();
        emitter.run_started(None).unwrap();
        assert_eq!(emitter.content("m1", "").unwrap(), None);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_suppression_guard_scopes_streaming() {
        let (emitter, mut rx) = emitter();
        emitter.run_started(None).unwrap();
        {
            let _guard = emitter.suppress_streaming();
            assert!(emitter.is_streaming_suppressed());
            assert_eq!(emitter.message_start("hidden").unwrap(), None);
            assert_eq!(emitter.custom("hidden", json!({})).unwrap(), None);
        }
        assert!(!emitter.is_streaming_suppressed());
        assert_eq!(emitter.message_start("m2").unwrap(), Some(1));
        assert_eq!(emitter.run_finished(None).unwrap(), Some(2));
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn test_non_interactive_run_keeps_lifecycle() {
        let (sink, mut rx) = ChannelSink::new();
        let emitter = OrderedEventEmitter::new("t1", "r1", Arc::new(sink)).non_interactive();
        emitter.run_started(None).unwrap();
        assert_eq!(emitter.message_start("m").unwrap(), None);
        assert_eq!(emitter.tool_result(Some("c"), json!("x")).unwrap(), None);
        assert_eq!(emitter.run_finished(None).unwrap(), Some(1));

        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.event.kind()).collect();
        assert_eq!(kinds, vec!["RUN_STARTED", "RUN_FINISHED"]);
    }

    #[test]
    fn test_token_stream_translation() {
        let (emitter, mut rx) = emitter();
        emitter.run_started(None).unwrap();
        emitter.message_start("m1").unwrap();
        emitter.token("m1", &TokenChunk::text("Let me scan that.")).unwrap();
        emitter
            .token("m1", &TokenChunk::tool_call_begin("call_1", "scan_cv"))
            .unwrap();
        emitter.token("m1", &TokenChunk::tool_call_args("{\"cv_url\":")).unwrap();
        emitter.token("m1", &TokenChunk::tool_call_args("\"x\"}")).unwrap();
        emitter.token("m1", &TokenChunk::finish(FINISH_TOOL_CALLS)).unwrap();
        emitter.message_end("m1", None).unwrap();
        emitter.tool_result(None, json!({"ok": true})).unwrap();

        let events = drain(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "RUN_STARTED",
                "TEXT_MESSAGE_START",
                "TEXT_MESSAGE_CONTENT",
                "TOOL_CALL_START",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_ARGS",
                "TOOL_CALL_END",
                "TEXT_MESSAGE_END",
                "TOOL_CALL_RESULT",
            ]
        );

        match &events[3].event {
            AgentEvent::ToolCallStart {
                tool_call_id,
                parent_message_id,
                ..
            } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(parent_message_id.as_deref(), Some("m1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[4].event {
            AgentEvent::ToolCallArgs { tool_call_id, .. } => assert_eq!(tool_call_id, "call_1"),
            other => panic!("unexpected event {:?}", other),
        }
        match &events[8].event {
            AgentEvent::ToolCallResult { tool_call_id, .. } => assert_eq!(tool_call_id, "call_1"),
            other => panic!("unexpected event {:?}", other),
        }
        for (i, envelope) in events.iter().enumerate() {
            assert_eq!(envelope.order, i as u64);
        }
    }

    #[test]
    fn test_sink_failure_does_not_consume_order() {
        let (sink, rx) = ChannelSink::new();
        let emitter = OrderedEventEmitter::new("t1", "r1", Arc::new(sink));
        drop(rx);
        assert!(matches!(emitter.run_started(None), Err(EventError::Sink(_))));
        assert!(!emitter.has_started());
        assert_eq!(emitter.next_order(), 0);
    }
}
