//! Scripted `ServerHandle` and `Connector` fakes shared across unit tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::McpError;
use crate::mcp::config::ServerConfig;
use crate::mcp::transport::{
    Completion, CompletionTarget, Connector, Discovery, PromptDescriptor, PromptOutput,
    ResourceDescriptor, ResourceOutput, ServerHandle, ToolDescriptor, ToolOutput,
};

pub fn tool(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: Some(format!("{name} test tool")),
        input_schema: json!({"type": "object"}),
    }
}

pub fn resource(uri: &str) -> ResourceDescriptor {
    ResourceDescriptor {
        uri: uri.to_string(),
        name: uri.rsplit('/').next().unwrap_or(uri).to_string(),
        description: None,
        mime_type: Some("text/plain".to_string()),
    }
}

pub fn prompt(name: &str) -> PromptDescriptor {
    PromptDescriptor {
        name: name.to_string(),
        description: None,
        arguments: vec![],
    }
}

pub fn discovery_with_tools(names: &[&str]) -> Discovery {
    Discovery {
        tools: names.iter().map(|n| tool(n)).collect(),
        ..Default::default()
    }
}

/// Scripted ping behavior: fail the next N probes, then succeed.
pub struct FailNextPings {
    remaining: AtomicU32,
}

impl FailNextPings {
    pub fn new(count: u32) -> Self {
        Self {
            remaining: AtomicU32::new(count),
        }
    }

    fn should_fail(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

type ToolFn =
    dyn Fn(&str, Option<&serde_json::Map<String, serde_json::Value>>) -> Result<ToolOutput, McpError>
        + Send
        + Sync;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tool: String,
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

/// In-memory server session with scriptable behavior per operation.
#[derive(Default)]
pub struct MockHandle {
    discovery: std::sync::Mutex<Option<Discovery>>,
    fail_discovery: bool,
    tool_fn: Option<Box<ToolFn>>,
    ping: Option<FailNextPings>,
    completions: Vec<String>,
    calls: std::sync::Mutex<Vec<RecordedCall>>,
    prompt_calls: std::sync::Mutex<Vec<RecordedCall>>,
    shutdowns: AtomicUsize,
}

impl MockHandle {
    pub fn with_discovery(self, discovery: Discovery) -> Self {
        *self.discovery.lock().unwrap() = Some(discovery);
        self
    }

    pub fn discovery_slot(&self) -> std::sync::MutexGuard<'_, Option<Discovery>> {
        self.discovery.lock().unwrap()
    }

    pub fn failing_discovery() -> Self {
        Self {
            fail_discovery: true,
            ..Default::default()
        }
    }

    pub fn with_tool_fn(
        mut self,
        f: impl Fn(
            &str,
            Option<&serde_json::Map<String, serde_json::Value>>,
        ) -> Result<ToolOutput, McpError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.tool_fn = Some(Box::new(f));
        self
    }

    pub fn with_ping(mut self, ping: FailNextPings) -> Self {
        self.ping = Some(ping);
        self
    }

    pub fn with_completions(mut self, values: Vec<String>) -> Self {
        self.completions = values;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompt_calls(&self) -> Vec<RecordedCall> {
        self.prompt_calls.lock().unwrap().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerHandle for MockHandle {
    async fn discover(&self) -> Result<Discovery, McpError> {
        if self.fail_discovery {
            return Err(McpError::Discovery {
                server: "mock".to_string(),
                message: "scripted discovery failure".to_string(),
            });
        }
        Ok(self.discovery.lock().unwrap().clone().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ToolOutput, McpError> {
        self.calls.lock().unwrap().push(RecordedCall {
            tool: name.clone(),
            arguments: arguments.clone(),
            meta,
        });
        match &self.tool_fn {
            Some(f) => f(&name, arguments.as_ref()),
            None => Ok(ToolOutput::text("ok")),
        }
    }

    async fn read_resource(
        &self,
        uri: String,
        _meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ResourceOutput, McpError> {
        Ok(ResourceOutput {
            contents: vec![crate::mcp::transport::ResourceContent::Text {
                uri,
                mime_type: Some("text/plain".to_string()),
                text: "resource body".to_string(),
            }],
        })
    }

    async fn get_prompt(
        &self,
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptOutput, McpError> {
        self.prompt_calls.lock().unwrap().push(RecordedCall {
            tool: name.clone(),
            arguments,
            meta,
        });
        Ok(PromptOutput {
            description: Some(name),
            messages: vec![],
        })
    }

    async fn complete(
        &self,
        _target: CompletionTarget,
        _argument_name: String,
        argument_value: String,
        _meta: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Completion, McpError> {
        let values = self
            .completions
            .iter()
            .filter(|v| v.starts_with(&argument_value))
            .cloned()
            .collect::<Vec<_>>();
        Ok(Completion {
            total: Some(values.len() as u32),
            values,
            has_more: false,
        })
    }

    async fn ping(&self, _timeout: Duration) -> Result<(), McpError> {
        match &self.ping {
            Some(script) if script.should_fail() => Err(McpError::Transport {
                server: "mock".to_string(),
                message: "scripted ping failure".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-registered handles by server name. Each name holds a queue;
/// the last handle in the queue is reused for every connect after the queue
/// drains to it.
#[derive(Default)]
pub struct MockConnector {
    handles: std::sync::Mutex<HashMap<String, VecDeque<Arc<dyn ServerHandle>>>>,
    connects: std::sync::Mutex<HashMap<String, usize>>,
    connect_limits: std::sync::Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn with_handle(self, name: &str, handle: Arc<dyn ServerHandle>) -> Self {
        self.handles
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(handle);
        self
    }

    /// Refuse connects for `name` beyond the first `limit`.
    pub fn with_connect_limit(self, name: &str, limit: usize) -> Self {
        self.connect_limits
            .lock()
            .unwrap()
            .insert(name.to_string(), limit);
        self
    }

    pub fn connect_count(&self, name: &str) -> usize {
        self.connects.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        server_name: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn ServerHandle>, McpError> {
        let count = {
            let mut connects = self.connects.lock().unwrap();
            let count = connects.entry(server_name.to_string()).or_default();
            *count += 1;
            *count
        };
        if let Some(limit) = self.connect_limits.lock().unwrap().get(server_name) {
            if count > *limit {
                return Err(McpError::Transport {
                    server: server_name.to_string(),
                    message: "connection refused".to_string(),
                });
            }
        }
        let mut handles = self.handles.lock().unwrap();
        let queue = handles
            .get_mut(server_name)
            .ok_or_else(|| McpError::Transport {
                server: server_name.to_string(),
                message: "connection refused".to_string(),
            })?;
        if queue.len() > 1 {
            queue.pop_front().ok_or_else(|| McpError::Transport {
                server: server_name.to_string(),
                message: "connection refused".to_string(),
            })
        } else {
            queue.front().cloned().ok_or_else(|| McpError::Transport {
                server: server_name.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }
}
