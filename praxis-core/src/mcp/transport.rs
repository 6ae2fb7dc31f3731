//! Transport/session seam between the aggregator and downstream servers.
//!
//! `ServerHandle` is the per-connection interface the aggregator consumes:
//! discovery, requests, keepalive, teardown. All rmcp wire types stay on
//! this side of the seam; the rest of the crate deals in the descriptor and
//! output types below. `RmcpHandle` implements the trait over the rmcp
//! client (stdio child process or streamable HTTP); tests substitute
//! scripted handles.

use async_trait::async_trait;
use llm::{ToolDefinition, ToolResultContent};
use rmcp::{
    ServiceExt,
    model::{
        ArgumentInfo, CallToolRequestParam, CallToolResult, CompleteRequestParam,
        GetPromptRequestParam, GetPromptResult, PromptMessageContent, PromptMessageRole,
        PromptReference, RawContent, ReadResourceRequestParam, Reference, ResourceContents,
        ResourceReference,
    },
    service::{Peer, RoleClient, RunningService, ServiceError},
    transport::{
        ConfigureCommandExt, TokioChildProcess,
        streamable_http_client::{StreamableHttpClientTransport, StreamableHttpClientTransportConfig},
    },
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::McpError;
use crate::mcp::config::{ServerConfig, TransportConfig};

/// A tool as advertised by one server, schema included.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Convert to the model-facing definition. Schemas that fail to parse
    /// fall back to an accept-anything schema rather than dropping the tool.
    pub fn to_definition(&self, namespaced_name: &str) -> ToolDefinition {
        let input_schema = serde_json::from_value(self.input_schema.clone())
            .unwrap_or_else(|_| schemars::schema_for!(serde_json::Value));
        ToolDefinition {
            name: namespaced_name.to_string(),
            description: self.description.clone(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptArgumentDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgumentDescriptor>,
}

/// Capability snapshot returned by discovery on one server.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    /// Free-text instructions the server wants prepended to the system
    /// prompt, if any.
    pub instructions: Option<String>,
    pub supports_completion: bool,
}

/// Result of one tool invocation, already converted to model-facing content.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Vec<ToolResultContent>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::text(text.into())],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::text(message.into())],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResourceContent {
    Text {
        uri: String,
        mime_type: Option<String>,
        text: String,
    },
    Blob {
        uri: String,
        mime_type: Option<String>,
        data: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ResourceOutput {
    pub contents: Vec<ResourceContent>,
}

#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct PromptOutput {
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// Argument-completion suggestions from one server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Completion {
    pub values: Vec<String>,
    pub total: Option<u32>,
    pub has_more: bool,
}

impl Completion {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A completion target: a resource template URI or a prompt name.
#[derive(Debug, Clone)]
pub enum CompletionTarget {
    Resource { uri: String },
    Prompt { name: String },
}

/// One live session with a downstream server.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    async fn discover(&self) -> Result<Discovery, McpError>;

    /// Invoke a tool by its server-local name. `meta` is out-of-band
    /// correlation metadata for the remote side; it must never surface in
    /// model-visible output. Every request-shaped method takes it; whether
    /// the wire format has a place for it is the implementation's concern.
    async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutput, McpError>;

    async fn read_resource(
        &self,
        uri: String,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ResourceOutput, McpError>;

    async fn get_prompt(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptOutput, McpError>;

    async fn complete(
        &self,
        target: CompletionTarget,
        argument_name: String,
        argument_value: String,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Completion, McpError>;

    /// Lightweight liveness probe. Failures feed the ping tracker only.
    async fn ping(&self, timeout: Duration) -> Result<(), McpError>;

    async fn shutdown(&self) -> Result<(), McpError>;
}

/// Opens connections for the registry; mocked in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server_name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ServerHandle>, McpError>;
}

/// Production connector backed by rmcp transports.
#[derive(Debug, Default)]
pub struct RmcpConnector;

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        server_name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ServerHandle>, McpError> {
        let handle = RmcpHandle::connect(server_name, config).await?;
        Ok(Arc::new(handle))
    }
}

/// rmcp-backed server session.
pub struct RmcpHandle {
    server_name: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpHandle {
    /// Connect over the configured transport and run the MCP handshake.
    pub async fn connect(server_name: &str, config: &ServerConfig) -> Result<Self, McpError> {
        let service = match &config.transport {
            TransportConfig::StreamableHttp { url, auth_token } => {
                let transport = if let Some(token) = auth_token {
                    let transport_config =
                        StreamableHttpClientTransportConfig::with_uri(Arc::from(url.as_str()))
                            .auth_header(token.to_string());
                    StreamableHttpClientTransport::from_config(transport_config)
                } else {
                    StreamableHttpClientTransport::from_uri(url.as_str())
                };
                ().serve(transport)
                    .await
                    .map_err(|e| transport_error(server_name, e))?
            }
            TransportConfig::Stdio { command, args, env } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| transport_error(server_name, e))?;
                ().serve(transport)
                    .await
                    .map_err(|e| transport_error(server_name, e))?
            }
        };

        let peer = service.peer().clone();
        Ok(Self {
            server_name: server_name.to_string(),
            peer,
            service: Mutex::new(Some(service)),
        })
    }
}

fn transport_error(server: &str, e: impl std::fmt::Display) -> McpError {
    McpError::Transport {
        server: server.to_string(),
        message: e.to_string(),
    }
}

fn map_service_error(server: &str, e: ServiceError) -> McpError {
    match e {
        ServiceError::TransportClosed => McpError::SessionTerminated {
            server: server.to_string(),
        },
        other => McpError::Transport {
            server: server.to_string(),
            message: other.to_string(),
        },
    }
}

/// Fold correlation metadata into an arguments object under the protocol's
/// reserved `_meta` key. The typed rmcp params carry no request-level meta,
/// so requests with an arguments object are the only place it can ride.
fn merge_meta(
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
    meta: Option<serde_json::Map<String, serde_json::Value>>,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    match meta {
        Some(meta) if !meta.is_empty() => {
            let mut merged = arguments.unwrap_or_default();
            merged.insert("_meta".to_string(), serde_json::Value::Object(meta));
            Some(merged)
        }
        _ => arguments,
    }
}

fn convert_tool(tool: &rmcp::model::Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
    }
}

fn convert_tool_output(result: CallToolResult) -> ToolOutput {
    let content = result
        .content
        .iter()
        .filter_map(|c| convert_content(&c.raw))
        .collect();
    ToolOutput {
        content,
        is_error: result.is_error.unwrap_or(false),
    }
}

/// Convert MCP content to the model-facing `ToolResultContent` shape.
fn convert_content(content: &RawContent) -> Option<ToolResultContent> {
    match content {
        RawContent::Text(text) => Some(ToolResultContent::text(&text.text)),
        RawContent::Image(img) => Some(ToolResultContent::image(&img.data, &img.mime_type)),
        RawContent::Audio(audio) => Some(ToolResultContent::audio(&audio.data, &audio.mime_type)),
        RawContent::Resource(resource) => match &resource.resource {
            ResourceContents::TextResourceContents { text, .. } => {
                Some(ToolResultContent::text(text))
            }
            ResourceContents::BlobResourceContents {
                blob, mime_type, ..
            } => {
                let mime = mime_type.as_deref().unwrap_or("application/octet-stream");
                if mime.starts_with("image/") {
                    Some(ToolResultContent::image(blob, mime))
                } else if mime.starts_with("audio/") {
                    Some(ToolResultContent::audio(blob, mime))
                } else {
                    // Unknown blob type, skip
                    None
                }
            }
        },
        // Resource links are references, not content
        RawContent::ResourceLink(_) => None,
    }
}

fn convert_prompt_output(result: GetPromptResult) -> PromptOutput {
    let messages = result
        .messages
        .into_iter()
        .filter_map(|m| {
            let role = match m.role {
                PromptMessageRole::User => "user",
                PromptMessageRole::Assistant => "assistant",
            };
            match m.content {
                PromptMessageContent::Text { text } => Some(PromptMessage {
                    role: role.to_string(),
                    text,
                }),
                _ => None,
            }
        })
        .collect();
    PromptOutput {
        description: result.description,
        messages,
    }
}

#[async_trait]
impl ServerHandle for RmcpHandle {
    async fn discover(&self) -> Result<Discovery, McpError> {
        let info = self.peer.peer_info().cloned();
        let (has_tools, has_resources, has_prompts, supports_completion, instructions) =
            match info {
                Some(i) => (
                    i.capabilities.tools.is_some(),
                    i.capabilities.resources.is_some(),
                    i.capabilities.prompts.is_some(),
                    i.capabilities.completions.is_some(),
                    i.instructions.clone(),
                ),
                None => (true, false, false, false, None),
            };

        let tools = if has_tools {
            self.peer
                .list_all_tools()
                .await
                .map_err(|e| map_service_error(&self.server_name, e))?
                .iter()
                .map(convert_tool)
                .collect()
        } else {
            Vec::new()
        };
        let resources = if has_resources {
            self.peer
                .list_all_resources()
                .await
                .map_err(|e| map_service_error(&self.server_name, e))?
                .into_iter()
                .map(|r| ResourceDescriptor {
                    uri: r.raw.uri.clone(),
                    name: r.raw.name.clone(),
                    description: r.raw.description.clone(),
                    mime_type: r.raw.mime_type.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let prompts = if has_prompts {
            self.peer
                .list_all_prompts()
                .await
                .map_err(|e| map_service_error(&self.server_name, e))?
                .into_iter()
                .map(|p| PromptDescriptor {
                    name: p.name.clone(),
                    description: p.description.clone(),
                    arguments: p
                        .arguments
                        .unwrap_or_default()
                        .into_iter()
                        .map(|a| PromptArgumentDescriptor {
                            name: a.name,
                            description: a.description,
                            required: a.required.unwrap_or(false),
                        })
                        .collect(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Discovery {
            tools,
            resources,
            prompts,
            instructions,
            supports_completion,
        })
    }

    async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutput, McpError> {
        // Servers that echo the merged meta back never reach the model with
        // it; only converted content blocks do.
        let arguments = merge_meta(arguments, meta);

        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: name.into(),
                arguments,
            })
            .await
            .map_err(|e| map_service_error(&self.server_name, e))?;
        Ok(convert_tool_output(result))
    }

    async fn read_resource(
        &self,
        uri: String,
        // resources/read has no arguments object to carry meta in.
        _meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ResourceOutput, McpError> {
        let result = self
            .peer
            .read_resource(ReadResourceRequestParam { uri })
            .await
            .map_err(|e| map_service_error(&self.server_name, e))?;
        let contents = result
            .contents
            .into_iter()
            .map(|c| match c {
                ResourceContents::TextResourceContents {
                    uri,
                    mime_type,
                    text,
                    ..
                } => ResourceContent::Text {
                    uri,
                    mime_type,
                    text,
                },
                ResourceContents::BlobResourceContents {
                    uri,
                    mime_type,
                    blob,
                    ..
                } => ResourceContent::Blob {
                    uri,
                    mime_type,
                    data: blob,
                },
            })
            .collect();
        Ok(ResourceOutput { contents })
    }

    async fn get_prompt(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptOutput, McpError> {
        let arguments = merge_meta(arguments, meta);
        let result = self
            .peer
            .get_prompt(GetPromptRequestParam { name, arguments })
            .await
            .map_err(|e| map_service_error(&self.server_name, e))?;
        Ok(convert_prompt_output(result))
    }

    async fn complete(
        &self,
        target: CompletionTarget,
        argument_name: String,
        argument_value: String,
        // completion/complete carries a reference and one argument, no
        // arguments object for meta to ride in.
        _meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Completion, McpError> {
        let reference = match target {
            CompletionTarget::Resource { uri } => Reference::Resource(ResourceReference { uri }),
            CompletionTarget::Prompt { name } => {
                Reference::Prompt(PromptReference { name, title: None })
            }
        };
        let result = self
            .peer
            .complete(CompleteRequestParam {
                r#ref: reference,
                argument: ArgumentInfo {
                    name: argument_name,
                    value: argument_value,
                },
                context: None,
            })
            .await
            .map_err(|e| map_service_error(&self.server_name, e))?;
        Ok(Completion {
            values: result.completion.values,
            total: result.completion.total,
            has_more: result.completion.has_more.unwrap_or(false),
        })
    }

    async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        // tools/list doubles as the keepalive probe; this rmcp client
        // exposes no typed ping request.
        match tokio::time::timeout(timeout, self.peer.list_tools(Default::default())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_service_error(&self.server_name, e)),
            Err(_) => Err(McpError::Transport {
                server: self.server_name.clone(),
                message: format!("ping timed out after {:?}", timeout),
            }),
        }
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        if let Some(service) = self.service.lock().await.take() {
            service
                .cancel()
                .await
                .map_err(|e| transport_error(&self.server_name, e))?;
        }
        Ok(())
    }
}
