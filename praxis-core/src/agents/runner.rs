//! Pull-based tool-execution loop.
//!
//! One `ToolRunner` drives one turn: generate, execute any tool calls the
//! model made, feed the results back, repeat. The caller pulls assistant
//! messages out one `step` at a time or drains the loop with
//! `run_until_done`. A runner is finite and never restarts; once it has
//! terminated, stepping it keeps returning `None`.

use async_trait::async_trait;
use futures::future::join_all;
use llm::{
    ChatMessage, ChatModel, ChatRequest, GenerateParams, StopReason, ToolCall, ToolResult,
    ToolResultContent,
};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conversation::Conversation;
use crate::error::AgentError;
use crate::events::{EventSink, ToolCallEvent};
use crate::mcp::aggregator::CallContext;
use crate::mcp::catalog::NAMESPACE_SEP;
use crate::mcp::transport::ToolOutput;

/// Executes one tool call. Failures that should not kill the turn must come
/// back as error-tagged output; only cancellation unwinds the loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &CallContext) -> ToolOutput;
}

/// How a turn came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStop {
    /// The model produced a message with no tool calls.
    End,
    /// The iteration budget ran out; the turn is truncated, not failed.
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_iterations: usize,
    /// Run a batch of tool calls one at a time instead of concurrently.
    pub force_sequential: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            force_sequential: false,
        }
    }
}

enum RunnerState {
    Active,
    Done(TurnStop),
    Failed,
}

pub struct ToolRunner<M, E> {
    model: M,
    executor: E,
    tools: Vec<llm::ToolDefinition>,
    params: GenerateParams,
    conversation: Conversation,
    ctx: CallContext,
    options: RunnerOptions,
    events: EventSink,
    cancel: CancellationToken,
    state: RunnerState,
    iterations: usize,
}

impl<M: ChatModel, E: ToolExecutor> ToolRunner<M, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: M,
        executor: E,
        tools: Vec<llm::ToolDefinition>,
        params: GenerateParams,
        conversation: Conversation,
        ctx: CallContext,
        options: RunnerOptions,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            model,
            executor,
            tools,
            params,
            conversation,
            ctx,
            options,
            events,
            cancel,
            state: RunnerState::Active,
            iterations: 0,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.conversation.messages()
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }

    pub fn stop(&self) -> Option<TurnStop> {
        match self.state {
            RunnerState::Done(stop) => Some(stop),
            _ => None,
        }
    }

    /// Queue a message for the next iteration.
    pub fn append_message(&mut self, message: ChatMessage) {
        self.conversation.push(message);
    }

    /// Swap generation parameters; takes effect on the next model call.
    pub fn set_params(&mut self, params: GenerateParams) {
        self.params = params;
    }

    /// Run one generate/execute iteration and yield the assistant message.
    /// Returns `None` once the turn has terminated.
    pub async fn step(&mut self) -> Result<Option<ChatMessage>, AgentError> {
        if !matches!(self.state, RunnerState::Active) {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.state = RunnerState::Failed;
            return Err(AgentError::Cancelled);
        }
        if self.iterations >= self.options.max_iterations {
            warn!(
                iterations = self.iterations,
                "iteration budget exhausted, ending turn"
            );
            self.state = RunnerState::Done(TurnStop::MaxIterations);
            return Ok(None);
        }
        self.iterations += 1;

        let request = ChatRequest::with_tools(self.conversation.messages(), self.tools.clone())
            .with_params(self.params.clone());
        let generated = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.model.generate(&request) => Some(result),
        };
        let message = match generated {
            None => {
                self.state = RunnerState::Failed;
                return Err(AgentError::Cancelled);
            }
            Some(Err(e)) => {
                self.state = RunnerState::Failed;
                return Err(AgentError::Model(e));
            }
            Some(Ok(message)) => message,
        };

        self.conversation.push(message.clone());

        let calls: Vec<ToolCall> = message.get_tool_calls().into_iter().cloned().collect();
        if calls.is_empty() || message.effective_stop_reason() != StopReason::ToolUse {
            self.state = RunnerState::Done(TurnStop::End);
            return Ok(Some(message));
        }

        debug!(count = calls.len(), "executing tool calls");
        let results = self.execute_batch(&calls).await?;
        self.conversation
            .submit_tool_results(results)
            .map_err(|e| {
                self.state = RunnerState::Failed;
                e
            })?;
        Ok(Some(message))
    }

    /// Drain the loop. Returns how the turn ended.
    pub async fn run_until_done(&mut self) -> Result<TurnStop, AgentError> {
        while self.step().await?.is_some() {}
        match self.state {
            RunnerState::Done(stop) => Ok(stop),
            // step() returned None without a terminal state; unreachable by
            // construction, treated as a clean end.
            _ => Ok(TurnStop::End),
        }
    }

    /// Execute one batch of calls. All calls run concurrently unless
    /// sequential mode is on; each produces exactly one result under its own
    /// id, in the request order of the calls. Cancellation drops any
    /// in-flight calls and unwinds.
    async fn execute_batch(&mut self, calls: &[ToolCall]) -> Result<Vec<ToolResult>, AgentError> {
        if self.cancel.is_cancelled() {
            self.state = RunnerState::Failed;
            return Err(AgentError::Cancelled);
        }
        for call in calls {
            let (server, tool) = split_namespace(&call.name);
            self.events.emit(ToolCallEvent::Start {
                call_id: call.id.clone(),
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }

        let started = Instant::now();
        let outputs: Option<Vec<ToolOutput>> = if self.options.force_sequential {
            let mut outputs = Vec::with_capacity(calls.len());
            let mut cancelled = false;
            for call in calls {
                let output = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    output = self.executor.execute(call, &self.ctx) => Some(output),
                };
                match output {
                    Some(output) => outputs.push(output),
                    None => {
                        cancelled = true;
                        break;
                    }
                }
            }
            if cancelled { None } else { Some(outputs) }
        } else {
            let futures = calls
                .iter()
                .map(|call| self.executor.execute(call, &self.ctx));
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                outputs = join_all(futures) => Some(outputs),
            }
        };
        let Some(outputs) = outputs else {
            self.state = RunnerState::Failed;
            return Err(AgentError::Cancelled);
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let results = calls
            .iter()
            .zip(outputs)
            .map(|(call, output)| {
                // Executors return complete output, so each call gets a
                // single delta carrying its text before the stop event.
                let text: String = output
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        ToolResultContent::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if !text.is_empty() {
                    self.events.emit(ToolCallEvent::Delta {
                        call_id: call.id.clone(),
                        content: text,
                    });
                }
                self.events.emit(ToolCallEvent::Stop {
                    call_id: call.id.clone(),
                    is_error: output.is_error,
                    duration_ms,
                });
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                }
            })
            .collect();
        Ok(results)
    }
}

fn split_namespace(name: &str) -> (&str, &str) {
    match name.split_once(NAMESPACE_SEP) {
        Some((server, local)) => (server, local),
        None => ("", name),
    }
}
