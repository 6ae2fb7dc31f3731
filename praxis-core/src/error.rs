//! Error taxonomy for the aggregation and tool-execution layers.
//!
//! Routing and transport failures are recoverable per call: the agent path
//! converts them to error-tagged tool output so the conversation continues.
//! Consistency violations and cancellation are never converted to results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("no server named '{name}' is attached")]
    UnknownServer { name: String },

    #[error("tool '{name}' not found on any attached server")]
    UnknownTool { name: String },

    #[error("tool '{name}' is ambiguous across servers: {servers:?}")]
    AmbiguousTool { name: String, servers: Vec<String> },

    #[error("resource '{uri}' not found on any attached server")]
    UnknownResource { uri: String },

    #[error("resource '{uri}' is ambiguous across servers: {servers:?}")]
    AmbiguousResource { uri: String, servers: Vec<String> },

    #[error("prompt '{name}' not found on any attached server")]
    UnknownPrompt { name: String },

    #[error("prompt '{name}' is ambiguous across servers: {servers:?}")]
    AmbiguousPrompt { name: String, servers: Vec<String> },

    #[error("discovery failed for server '{server}': {message}")]
    Discovery { server: String, message: String },

    #[error("transport error on server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("server '{server}' terminated the session")]
    SessionTerminated { server: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl McpError {
    /// Whether this error should surface to the model as ordinary
    /// unsuccessful tool output rather than aborting the turn.
    pub fn is_tool_recoverable(&self) -> bool {
        !matches!(self, McpError::Config { .. })
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// A new user turn was requested while the previous assistant message
    /// still has unanswered tool calls. Programming error, raised
    /// immediately.
    #[error("conversation has unanswered tool calls: {call_ids:?}")]
    PendingToolCalls { call_ids: Vec<String> },

    /// Submitted tool results do not match the pending calls.
    #[error("tool results do not match pending calls (expected {expected:?}, got {got:?})")]
    UnexpectedResults {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("model call failed: {0}")]
    Model(#[source] anyhow::Error),

    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Re-raised to the caller after cleanup; never converted to a result.
    #[error("turn cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_errors_are_tool_recoverable() {
        assert!(McpError::UnknownTool {
            name: "fetch".into()
        }
        .is_tool_recoverable());
        assert!(McpError::AmbiguousTool {
            name: "read".into(),
            servers: vec!["fs".into(), "web".into()],
        }
        .is_tool_recoverable());
        assert!(McpError::Transport {
            server: "fs".into(),
            message: "timed out".into(),
        }
        .is_tool_recoverable());
        assert!(!McpError::Config {
            message: "bad separator".into()
        }
        .is_tool_recoverable());
    }

    #[test]
    fn test_display_names_the_offender() {
        let err = McpError::SessionTerminated {
            server: "search".into(),
        };
        assert!(err.to_string().contains("search"));
    }
}
