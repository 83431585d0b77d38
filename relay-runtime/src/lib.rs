//! Relay runtime
//!
//! Drives named runs for tasks pulled from a durable queue and streams
//! their events, in order, to the real-time channel.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod runtime;
pub mod tool_step;

pub use config::{load_config, AmqpConfig, ConfigError, RetryConfig, RuntimeConfig, SocketConfig};
pub use context::RunContext;
pub use error::RuntimeError;
pub use orchestrator::RunOrchestrator;
pub use registry::RunRegistry;
pub use run::{Run, RunError, RunOutcome};
pub use runtime::{
    route_client_payload, ClientResponse, Runtime, CLIENT_RESPONSE_EVENT, JOIN_EVENT,
};
pub use tool_step::{run_tool_calls, ClientTool, ToolOutput, ToolSet, ToolStep};
