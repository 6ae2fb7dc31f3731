use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

/// Why the model stopped generating.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: schemars::schema::RootSchema,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Content within a tool result - text, images or audio, without recursive
/// tool calls.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Audio { data: String, mime_type: String },
}

impl ToolResultContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResultContent::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ToolResultContent::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn audio(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ToolResultContent::Audio {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: Vec<ToolResultContent>,
    /// Marks results that carry an error description instead of output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    /// Get text content from this tool result, concatenated
    pub fn get_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolResultContent::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct ChatPayload {
    pub content: Vec<ContentBlock>,
}

impl From<&str> for ChatPayload {
    fn from(text: &str) -> Self {
        ChatPayload::text(text)
    }
}

impl From<String> for ChatPayload {
    fn from(text: String) -> Self {
        ChatPayload::text(text)
    }
}

impl ChatPayload {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        ChatPayload { content }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ChatPayload {
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn with_tool_calls(text: String, tool_calls: Vec<ToolCall>) -> Self {
        let mut content = vec![ContentBlock::Text { text }];
        content.extend(tool_calls.into_iter().map(ContentBlock::ToolCall));
        ChatPayload { content }
    }

    /// Create a payload holding one tool result.
    pub fn tool_result(tool_call_id: String, result_content: Vec<ToolResultContent>) -> Self {
        ChatPayload {
            content: vec![ContentBlock::ToolResult(ToolResult {
                tool_call_id,
                content: result_content,
                is_error: false,
            })],
        }
    }

    /// Create a simple text-only tool result (convenience method)
    pub fn tool_result_text(tool_call_id: String, text: String) -> Self {
        Self::tool_result(tool_call_id, vec![ToolResultContent::Text { text }])
    }

    pub fn get_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn get_tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn get_tool_results(&self) -> Vec<&ToolResult> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(flatten)]
    pub payload: ChatPayload,
    /// Set on assistant messages by the provider; absent on user/system
    /// messages. A message carrying tool calls with no explicit stop reason
    /// is treated as tool use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ChatMessage {
    pub fn new(role: Role, payload: ChatPayload) -> Self {
        Self {
            role,
            payload,
            stop_reason: None,
        }
    }

    pub fn user(payload: ChatPayload) -> Self {
        Self::new(Role::User, payload)
    }

    pub fn assistant(payload: ChatPayload) -> Self {
        Self::new(Role::Assistant, payload)
    }

    pub fn system(payload: ChatPayload) -> Self {
        Self::new(Role::System, payload)
    }

    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    pub fn get_text(&self) -> String {
        self.payload.get_text()
    }

    pub fn get_tool_calls(&self) -> Vec<&ToolCall> {
        self.payload.get_tool_calls()
    }

    pub fn get_tool_results(&self) -> Vec<&ToolResult> {
        self.payload.get_tool_results()
    }

    /// Effective stop reason: an explicit one wins, otherwise the presence
    /// of tool calls decides.
    pub fn effective_stop_reason(&self) -> StopReason {
        match self.stop_reason {
            Some(reason) => reason,
            None if !self.get_tool_calls().is_empty() => StopReason::ToolUse,
            None => StopReason::EndTurn,
        }
    }
}

/// Request parameters replaceable between runner iterations.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct GenerateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatRequest {
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) tools: Option<Vec<ToolDefinition>>,
    pub(crate) params: GenerateParams,
}

impl ChatRequest {
    /// Create a new chat request from an iterator of message references.
    ///
    /// Accepts anything yielding `&ChatMessage`; messages are cloned once
    /// when constructing the request.
    pub fn new<'a>(messages: impl IntoIterator<Item = &'a ChatMessage>) -> Self {
        ChatRequest {
            messages: messages.into_iter().cloned().collect(),
            tools: None,
            params: GenerateParams::default(),
        }
    }

    /// Create a chat request with tool definitions
    pub fn with_tools<'a>(
        messages: impl IntoIterator<Item = &'a ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        ChatRequest {
            messages: messages.into_iter().cloned().collect(),
            tools: Some(tools),
            params: GenerateParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerateParams) -> Self {
        self.params = params;
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn tools(&self) -> Option<&[ToolDefinition]> {
        self.tools.as_deref()
    }

    pub fn params(&self) -> &GenerateParams {
        &self.params
    }
}
