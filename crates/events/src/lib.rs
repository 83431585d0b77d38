//! Relay event protocol.
//!
//! Every run gets its own [`OrderedEventEmitter`]; all emitters share one
//! outbound [`EventSink`] that multiplexes runs onto the real-time channel.

pub mod emitter;
pub mod event;
pub mod sink;
pub mod stream;

pub use emitter::{EventError, OrderedEventEmitter, SuppressionGuard};
pub use event::{AgentEvent, EventEnvelope, TASK_FAILED};
pub use sink::{ChannelSink, EventSink, SinkError, ThreadedSink, Transport, AGUI_EVENT};
pub use stream::{TokenChunk, ToolCallChunk, FINISH_TOOL_CALLS};
