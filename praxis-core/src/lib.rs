//! Core runtime for the praxis agent framework
//!
//! This crate provides:
//! - **MCP aggregation**: `McpAggregator` over any number of downstream
//!   servers, with a namespaced capability catalog, per-server health and
//!   channel accounting, and typed routing errors
//! - **Tool execution**: `ToolRunner`, a pull-based generate/execute loop,
//!   and `ToolAgent`, which binds it to the aggregator with per-conversation
//!   turn serialization and cancellation rollback
//! - **Conversation**: history with tool-call bookkeeping and the
//!   pending-results invariant
//!
//! # Example
//!
//! ```ignore
//! use praxis_core::{AgentOptions, McpAggregator, ServerConfig, ToolAgent};
//!
//! let aggregator = Arc::new(McpAggregator::new());
//! aggregator.attach_server("docs", ServerConfig::streamable_http(url)).await?;
//! let agent = ToolAgent::new(model, aggregator, AgentOptions::default());
//! let turn = agent.generate("conv-1", payload, cancel).await?;
//! ```
pub mod agents;
pub mod conversation;
pub mod error;
pub mod events;
pub mod mcp;

pub use agents::{AgentOptions, RunnerOptions, ToolAgent, ToolExecutor, ToolRunner, Turn, TurnStop};
pub use conversation::{Conversation, ConversationId};
pub use error::{AgentError, McpError};
pub use events::{EventSink, ToolCallEvent};
pub use mcp::{
    AggregatorConfig, CallContext, McpAggregator, ServerConfig, ServerStatus, TransportConfig,
};
