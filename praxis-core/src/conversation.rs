//! Conversation history and the tool-call bookkeeping on top of it.
//!
//! A turn that ends in tool calls leaves the conversation in a state where
//! the only valid continuation is submitting results for exactly those
//! calls. That invariant is checked here, immediately, rather than letting
//! a malformed history reach a model.

use llm::{ChatMessage, ChatPayload, Role, ToolCall, ToolResult};

use crate::error::AgentError;

pub type ConversationId = String;

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Tool calls of the last assistant message that have no matching
    /// result anywhere after it.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(last_assistant) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };
        let calls = self.messages[last_assistant].get_tool_calls();
        if calls.is_empty() {
            return Vec::new();
        }
        let answered: Vec<&str> = self.messages[last_assistant + 1..]
            .iter()
            .flat_map(|m| m.get_tool_results())
            .map(|r| r.tool_call_id.as_str())
            .collect();
        calls
            .into_iter()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .cloned()
            .collect()
    }

    /// Fail fast when unanswered tool calls exist. A new user turn must not
    /// start on such a history.
    pub fn check_ready_for_user_turn(&self) -> Result<(), AgentError> {
        let pending = self.pending_tool_calls();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(AgentError::PendingToolCalls {
                call_ids: pending.into_iter().map(|c| c.id).collect(),
            })
        }
    }

    /// Append results for the pending tool calls. The submitted ids must
    /// match the pending set exactly; results land in a single user message
    /// ordered like the original calls.
    pub fn submit_tool_results(&mut self, results: Vec<ToolResult>) -> Result<(), AgentError> {
        let pending = self.pending_tool_calls();
        let expected: Vec<String> = pending.iter().map(|c| c.id.clone()).collect();
        let mut got: Vec<String> = results.iter().map(|r| r.tool_call_id.clone()).collect();
        got.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        if expected_sorted != got || results.len() != pending.len() {
            return Err(AgentError::UnexpectedResults {
                expected,
                got: results.into_iter().map(|r| r.tool_call_id).collect(),
            });
        }

        let mut by_id: std::collections::HashMap<String, ToolResult> = results
            .into_iter()
            .map(|r| (r.tool_call_id.clone(), r))
            .collect();
        let blocks: Vec<llm::ContentBlock> = expected
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(llm::ContentBlock::ToolResult)
            .collect();
        self.messages
            .push(ChatMessage::user(ChatPayload::new(blocks)));
        Ok(())
    }

    /// Mark the current history length for a later rollback.
    pub fn snapshot(&self) -> usize {
        self.messages.len()
    }

    /// Drop everything appended after `snapshot`.
    pub fn rollback(&mut self, snapshot: usize) {
        self.messages.truncate(snapshot);
    }
}
