//! Tool-execution layer: the pull-based runner and the agent that binds it
//! to the MCP aggregator.

pub mod runner;
pub mod tool_agent;

pub use runner::{RunnerOptions, ToolExecutor, ToolRunner, TurnStop};
pub use tool_agent::{AgentOptions, ToolAgent, Turn};
