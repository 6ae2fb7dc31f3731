//! Agent that answers user turns with model generations and MCP tool calls.
//!
//! Each conversation id maps to its own history behind its own async mutex,
//! so turns on one conversation are strictly serialized while distinct
//! conversations proceed independently. A turn runs on a working copy of
//! the history and commits only on clean termination; cancellation and
//! model failures leave the history exactly as it was.

use async_trait::async_trait;
use llm::{ChatMessage, ChatModel, ChatPayload, GenerateParams, ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::runner::{RunnerOptions, ToolExecutor, ToolRunner, TurnStop};
use crate::conversation::{Conversation, ConversationId};
use crate::error::AgentError;
use crate::events::{EventSink, ToolCallEvent};
use crate::mcp::aggregator::{CallContext, McpAggregator};
use crate::mcp::transport::ToolOutput;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub params: GenerateParams,
    pub max_iterations: usize,
    pub force_sequential: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            params: GenerateParams::default(),
            max_iterations: 10,
            force_sequential: false,
        }
    }
}

impl AgentOptions {
    /// Defaults with the aggregator config's execution knobs applied.
    pub fn from_config(config: &crate::mcp::config::AggregatorConfig) -> Self {
        Self {
            force_sequential: config.force_sequential,
            ..Default::default()
        }
    }
}

/// Everything one `generate` call produced: the messages appended to the
/// history and how the turn ended.
#[derive(Debug, Clone)]
pub struct Turn {
    pub messages: Vec<ChatMessage>,
    pub stop: TurnStop,
}

/// Routes the runner's tool calls through the aggregator. Routing and
/// transport failures become error-tagged tool output so the model can see
/// and react to them.
struct AggregatorExecutor {
    aggregator: Arc<McpAggregator>,
}

#[async_trait]
impl ToolExecutor for AggregatorExecutor {
    async fn execute(&self, call: &ToolCall, ctx: &CallContext) -> ToolOutput {
        let arguments = call.arguments.as_object().cloned();
        match self.aggregator.call_tool(&call.name, arguments, ctx).await {
            Ok(output) => output,
            Err(e) => {
                if e.is_tool_recoverable() {
                    debug!(tool = %call.name, error = %e, "tool call failed, reporting to model");
                } else {
                    warn!(tool = %call.name, error = %e, "tool call failed");
                }
                ToolOutput::error(e.to_string())
            }
        }
    }
}

pub struct ToolAgent {
    model: Arc<dyn ChatModel>,
    aggregator: Arc<McpAggregator>,
    options: AgentOptions,
    conversations: std::sync::Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<Conversation>>>>,
    events: EventSink,
}

impl ToolAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        aggregator: Arc<McpAggregator>,
        options: AgentOptions,
    ) -> Self {
        Self {
            model,
            aggregator,
            options,
            conversations: std::sync::Mutex::new(HashMap::new()),
            events: EventSink::disabled(),
        }
    }

    /// Replace the event sink and hand back its receiver.
    pub fn subscribe_events(&mut self) -> UnboundedReceiver<ToolCallEvent> {
        let (sink, rx) = EventSink::new();
        self.events = sink;
        rx
    }

    /// Seed or replace the history of one conversation.
    pub async fn load_history(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        let handle = self.conversation_handle(conversation_id);
        *handle.lock().await = Conversation::from_messages(messages);
    }

    pub async fn history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let handle = {
            let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            map.get(conversation_id).cloned()
        };
        match handle {
            Some(conv) => conv.lock().await.messages().to_vec(),
            None => Vec::new(),
        }
    }

    /// Run one user turn to completion. Holds the conversation's mutex for
    /// the whole turn; concurrent calls on the same id queue up behind it.
    pub async fn generate(
        &self,
        conversation_id: &str,
        payload: ChatPayload,
        cancel: CancellationToken,
    ) -> Result<Turn, AgentError> {
        let handle = self.conversation_handle(conversation_id);
        let mut conv = handle.lock().await;
        conv.check_ready_for_user_turn()?;

        let snapshot = conv.snapshot();
        let mut working = conv.clone();
        working.push(ChatMessage::user(payload));
        self.run_turn(conversation_id, working, snapshot, &mut conv, cancel)
            .await
    }

    /// Continue a turn that stopped on tool calls the caller executed
    /// externally. The results must answer the pending calls exactly.
    pub async fn submit_tool_results(
        &self,
        conversation_id: &str,
        results: Vec<ToolResult>,
        cancel: CancellationToken,
    ) -> Result<Turn, AgentError> {
        let handle = self.conversation_handle(conversation_id);
        let mut conv = handle.lock().await;

        let snapshot = conv.snapshot();
        let mut working = conv.clone();
        working.submit_tool_results(results)?;
        self.run_turn(conversation_id, working, snapshot, &mut conv, cancel)
            .await
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        working: Conversation,
        snapshot: usize,
        conv: &mut Conversation,
        cancel: CancellationToken,
    ) -> Result<Turn, AgentError> {
        let tools = self.aggregator.tool_definitions().await;
        let ctx = CallContext {
            conversation_id: Some(conversation_id.to_string()),
        };
        let mut runner = ToolRunner::new(
            Arc::clone(&self.model),
            AggregatorExecutor {
                aggregator: Arc::clone(&self.aggregator),
            },
            tools,
            self.options.params.clone(),
            working,
            ctx,
            RunnerOptions {
                max_iterations: self.options.max_iterations,
                force_sequential: self.options.force_sequential,
            },
            self.events.clone(),
            cancel,
        );

        // The working copy is committed only on clean termination; any
        // error leaves `conv` at the pre-turn snapshot.
        let stop = runner.run_until_done().await?;
        let finished = runner.into_conversation();
        let messages = finished.messages()[snapshot..].to_vec();
        *conv = finished;
        debug!(
            conversation = %conversation_id,
            appended = messages.len(),
            "turn committed"
        );
        Ok(Turn { messages, stop })
    }

    fn conversation_handle(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<Conversation>> {
        let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Conversation::new()))),
        )
    }
}
