//! Aggregator façade over every attached MCP server.
//!
//! Owns the connection registry and the namespaced catalog behind one
//! `RwLock`. Mutations (attach, detach, refresh, reconnect) hold the write
//! lock for the whole mutation; the call paths take the read lock, clone
//! the handle they need, and release it before any network I/O.

use llm::ToolDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::mcp::catalog::{Catalog, CatalogEntry, Route};
use crate::mcp::config::{AggregatorConfig, ServerConfig};
use crate::mcp::registry::{ConnectionRegistry, ServerConnection, ServerStatus};
use crate::mcp::transport::{
    Completion, CompletionTarget, Connector, Discovery, PromptDescriptor, PromptOutput,
    ResourceDescriptor, ResourceOutput, RmcpConnector, ToolDescriptor, ToolOutput,
};

/// Per-call correlation data forwarded to servers as session metadata.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub conversation_id: Option<String>,
}

struct AggregatorState {
    registry: ConnectionRegistry,
    catalog: Catalog,
}

pub struct McpAggregator {
    state: RwLock<AggregatorState>,
}

impl McpAggregator {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(RmcpConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            state: RwLock::new(AggregatorState {
                registry: ConnectionRegistry::new(connector),
                catalog: Catalog::default(),
            }),
        }
    }

    /// Attach every configured server. Failures are logged per server and
    /// never abort the rest.
    pub async fn from_config(config: &AggregatorConfig, connector: Arc<dyn Connector>) -> Self {
        let aggregator = Self::with_connector(connector);
        for (name, server_config) in &config.servers {
            let server_config = config.apply_defaults(server_config);
            if let Err(e) = aggregator.attach_server(name, server_config).await {
                warn!(server = %name, error = %e, "failed to attach server");
            }
        }
        aggregator
    }

    /// Connect one server, discover its capabilities, and merge them into
    /// the catalog. A discovery failure keeps the connection attached with
    /// an empty capability set; a connection failure detaches nothing else.
    pub async fn attach_server(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<(), McpError> {
        if name.is_empty() || name.contains(crate::mcp::catalog::NAMESPACE_SEP) {
            return Err(McpError::Config {
                message: format!(
                    "invalid server name '{name}': must be non-empty and free of '{}'",
                    crate::mcp::catalog::NAMESPACE_SEP
                ),
            });
        }
        let mut state = self.state.write().await;
        if state.registry.contains(name) {
            return Err(McpError::Config {
                message: format!("server '{name}' is already attached"),
            });
        }

        let connector = state.registry.connector();
        let handle = connector.connect(name, &config).await?;
        let discovery = match handle.discover().await {
            Ok(d) => d,
            Err(e) => {
                warn!(server = %name, error = %e, "discovery failed, attaching with empty catalog");
                Discovery::default()
            }
        };

        info!(
            server = %name,
            tools = discovery.tools.len(),
            resources = discovery.resources.len(),
            prompts = discovery.prompts.len(),
            persistent = config.persistent,
            "attached server"
        );

        let handle = if config.persistent {
            Some(handle)
        } else {
            // Non-persistent servers reconnect per invocation.
            if let Err(e) = handle.shutdown().await {
                debug!(server = %name, error = %e, "discovery session close failed");
            }
            None
        };

        state.catalog.merge_server(name, &discovery);
        let connection = Arc::new(ServerConnection::new(
            name.to_string(),
            config,
            handle,
            discovery,
        ));
        connection.start_ping_loop();
        state.registry.insert(connection);
        Ok(())
    }

    /// Drop a server: catalog entries go first, then the session.
    pub async fn detach_server(&self, name: &str) -> Result<(), McpError> {
        let mut state = self.state.write().await;
        state.catalog.remove_server(name);
        if state.registry.remove(name).await? {
            info!(server = %name, "detached server");
            Ok(())
        } else {
            Err(McpError::UnknownServer {
                name: name.to_string(),
            })
        }
    }

    /// Re-run discovery on one server and replace its catalog entries.
    pub async fn refresh_server(&self, name: &str) -> Result<(), McpError> {
        let mut state = self.state.write().await;
        let conn = state
            .registry
            .get(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;
        let connector = state.registry.connector();
        let discovery = match conn.handle() {
            Some(handle) => handle.discover().await?,
            None => {
                let handle = connector.connect(name, &conn.config).await?;
                let discovery = handle.discover().await;
                if let Err(e) = handle.shutdown().await {
                    debug!(server = %name, error = %e, "refresh session close failed");
                }
                discovery?
            }
        };
        conn.set_discovery(discovery.clone());
        state.catalog.merge_server(name, &discovery);
        Ok(())
    }

    /// Refresh every attached server; failures are logged and skipped.
    pub async fn refresh_all(&self) {
        let names = self.state.read().await.registry.names();
        for name in names {
            if let Err(e) = self.refresh_server(&name).await {
                warn!(server = %name, error = %e, "refresh failed");
            }
        }
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names = self.state.read().await.registry.names();
        names.sort();
        names
    }

    /// Merged namespaced tool catalog.
    pub async fn list_tools(&self) -> Vec<(String, CatalogEntry<ToolDescriptor>)> {
        self.state.read().await.catalog.tools()
    }

    pub async fn list_resources(&self) -> Vec<(String, CatalogEntry<ResourceDescriptor>)> {
        self.state.read().await.catalog.resources()
    }

    pub async fn list_prompts(&self) -> Vec<(String, CatalogEntry<PromptDescriptor>)> {
        self.state.read().await.catalog.prompts()
    }

    /// Model-facing definitions under their namespaced names.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.state
            .read()
            .await
            .catalog
            .tools()
            .into_iter()
            .map(|(name, entry)| entry.descriptor.to_definition(&name))
            .collect()
    }

    /// Server-provided instructions, for callers assembling a system prompt.
    pub async fn instructions(&self) -> Vec<(String, String)> {
        let state = self.state.read().await;
        let mut out: Vec<(String, String)> = state
            .registry
            .connections()
            .filter_map(|c| {
                c.discovery()
                    .instructions
                    .map(|i| (c.name.clone(), i))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Invoke a namespaced tool. Transport failures update the owning
    /// server's health counters; a terminated session on a server configured
    /// for it gets exactly one reconnect-and-retry.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        ctx: &CallContext,
    ) -> Result<ToolOutput, McpError> {
        let (route, conn, arguments) = {
            let state = self.state.read().await;
            let route = state
                .catalog
                .resolve_tool(name, |s| state.registry.contains(s))?;
            let conn = state
                .registry
                .get(&route.server)
                .ok_or_else(|| McpError::UnknownServer {
                    name: route.server.clone(),
                })?;
            let arguments = match (arguments, state.catalog.tool_descriptor(&route)) {
                (Some(args), Some(descriptor)) => {
                    Some(coerce_arguments(args, &descriptor.input_schema))
                }
                (args, _) => args,
            };
            (route, conn, arguments)
        };

        let meta = build_meta(ctx, conn.session_cookie());
        conn.metrics.record_request();

        let result = self
            .dispatch_tool(&conn, &route, arguments.clone(), meta.clone())
            .await;
        let mut conn = conn;
        let result = match result {
            Err(McpError::SessionTerminated { .. })
                if conn.config.persistent && conn.config.reconnect_on_disconnect =>
            {
                warn!(server = %route.server, tool = %route.local_name, "session terminated, reconnecting");
                conn = self.reconnect(&route.server).await?;
                let meta = build_meta(ctx, conn.session_cookie());
                self.dispatch_tool(&conn, &route, arguments, meta).await
            }
            other => other,
        };

        match &result {
            Ok(output) => {
                conn.metrics.record_response();
                conn.health.record_ok();
                debug!(
                    server = %route.server,
                    tool = %route.local_name,
                    is_error = output.is_error,
                    "tool call completed"
                );
            }
            Err(e) => {
                conn.health.record_fail();
                warn!(server = %route.server, tool = %route.local_name, error = %e, "tool call failed");
            }
        }
        result
    }

    async fn dispatch_tool(
        &self,
        conn: &Arc<ServerConnection>,
        route: &Route,
        arguments: Option<serde_json::Map<String, Value>>,
        meta: Option<serde_json::Map<String, Value>>,
    ) -> Result<ToolOutput, McpError> {
        match conn.handle() {
            Some(handle) => {
                handle
                    .call_tool(route.local_name.clone(), arguments, meta)
                    .await
            }
            None => {
                let connector = self.state.read().await.registry.connector();
                let handle = connector.connect(&conn.name, &conn.config).await?;
                let result = handle
                    .call_tool(route.local_name.clone(), arguments, meta)
                    .await;
                if let Err(e) = handle.shutdown().await {
                    debug!(server = %conn.name, error = %e, "per-call session close failed");
                }
                result
            }
        }
    }

    /// Re-open one persistent connection and re-merge its discovery,
    /// returning the replacement. The old connection is swapped out only
    /// once the new one is up; a failed connect leaves the server attached
    /// so its status keeps accumulating failures.
    async fn reconnect(&self, name: &str) -> Result<Arc<ServerConnection>, McpError> {
        let mut state = self.state.write().await;
        let old = state
            .registry
            .get(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;
        let config = old.config.clone();
        let connector = state.registry.connector();
        let handle = match connector.connect(name, &config).await {
            Ok(handle) => handle,
            Err(e) => {
                old.health.record_fail();
                warn!(server = %name, error = %e, "reconnect failed, keeping stale connection");
                return Err(e);
            }
        };
        let discovery = match handle.discover().await {
            Ok(d) => d,
            Err(e) => {
                warn!(server = %name, error = %e, "discovery failed after reconnect");
                Discovery::default()
            }
        };

        if let Err(e) = state.registry.remove(name).await {
            // The old session is already dead; its close failure is expected.
            debug!(server = %name, error = %e, "stale session close failed");
        }
        state.catalog.remove_server(name);
        state.catalog.merge_server(name, &discovery);
        let conn = Arc::new(ServerConnection::new(
            name.to_string(),
            config,
            Some(handle),
            discovery,
        ));
        conn.start_ping_loop();
        state.registry.insert(Arc::clone(&conn));
        info!(server = %name, "reconnected");
        Ok(conn)
    }

    /// Fetch a resource by namespaced URI, or by bare URI when `server`
    /// pins the owner.
    pub async fn get_resource(
        &self,
        uri: &str,
        server: Option<&str>,
        ctx: &CallContext,
    ) -> Result<ResourceOutput, McpError> {
        let (route, conn) = self.route_resource(uri, server).await?;
        let meta = build_meta(ctx, conn.session_cookie());
        match conn.handle() {
            Some(handle) => handle.read_resource(route.local_name, meta).await,
            None => {
                let connector = self.state.read().await.registry.connector();
                let handle = connector.connect(&conn.name, &conn.config).await?;
                let result = handle.read_resource(route.local_name, meta).await;
                let _ = handle.shutdown().await;
                result
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        server: Option<&str>,
        ctx: &CallContext,
    ) -> Result<PromptOutput, McpError> {
        let (route, conn) = {
            let state = self.state.read().await;
            let route = match server {
                Some(s) => Route {
                    server: s.to_string(),
                    local_name: name.to_string(),
                },
                None => state
                    .catalog
                    .resolve_prompt(name, |s| state.registry.contains(s))?,
            };
            let conn = state
                .registry
                .get(&route.server)
                .ok_or_else(|| McpError::UnknownServer {
                    name: route.server.clone(),
                })?;
            (route, conn)
        };
        let meta = build_meta(ctx, conn.session_cookie());
        match conn.handle() {
            Some(handle) => handle.get_prompt(route.local_name, arguments, meta).await,
            None => {
                let connector = self.state.read().await.registry.connector();
                let handle = connector.connect(&conn.name, &conn.config).await?;
                let result = handle.get_prompt(route.local_name, arguments, meta).await;
                let _ = handle.shutdown().await;
                result
            }
        }
    }

    /// Argument completion. Servers that never advertised the completion
    /// capability yield an empty completion, not an error.
    pub async fn complete_argument(
        &self,
        target: CompletionTarget,
        argument_name: &str,
        argument_value: &str,
        server: Option<&str>,
        ctx: &CallContext,
    ) -> Result<Completion, McpError> {
        let (target, conn) = {
            let state = self.state.read().await;
            let (route, target) = match (&target, server) {
                (t, Some(s)) => (
                    Route {
                        server: s.to_string(),
                        local_name: String::new(),
                    },
                    t.clone(),
                ),
                (CompletionTarget::Resource { uri }, None) => {
                    let route = state
                        .catalog
                        .resolve_resource(uri, |s| state.registry.contains(s))?;
                    let target = CompletionTarget::Resource {
                        uri: route.local_name.clone(),
                    };
                    (route, target)
                }
                (CompletionTarget::Prompt { name }, None) => {
                    let route = state
                        .catalog
                        .resolve_prompt(name, |s| state.registry.contains(s))?;
                    let target = CompletionTarget::Prompt {
                        name: route.local_name.clone(),
                    };
                    (route, target)
                }
            };
            let conn = state
                .registry
                .get(&route.server)
                .ok_or_else(|| McpError::UnknownServer {
                    name: route.server.clone(),
                })?;
            (target, conn)
        };

        if !conn.discovery().supports_completion {
            return Ok(Completion::empty());
        }
        let meta = build_meta(ctx, conn.session_cookie());
        match conn.handle() {
            Some(handle) => {
                handle
                    .complete(
                        target,
                        argument_name.to_string(),
                        argument_value.to_string(),
                        meta,
                    )
                    .await
            }
            None => {
                let connector = self.state.read().await.registry.connector();
                let handle = connector.connect(&conn.name, &conn.config).await?;
                let result = handle
                    .complete(
                        target,
                        argument_name.to_string(),
                        argument_value.to_string(),
                        meta,
                    )
                    .await;
                let _ = handle.shutdown().await;
                result
            }
        }
    }

    /// Point-in-time status of every attached server.
    pub async fn collect_server_status(&self) -> HashMap<String, ServerStatus> {
        let state = self.state.read().await;
        state
            .registry
            .connections()
            .map(|c| (c.name.clone(), c.status()))
            .collect()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.registry.shutdown_all().await;
    }

    async fn route_resource(
        &self,
        uri: &str,
        server: Option<&str>,
    ) -> Result<(Route, Arc<ServerConnection>), McpError> {
        let state = self.state.read().await;
        let route = match server {
            Some(s) => Route {
                server: s.to_string(),
                local_name: uri.to_string(),
            },
            None => state
                .catalog
                .resolve_resource(uri, |s| state.registry.contains(s))?,
        };
        let conn = state
            .registry
            .get(&route.server)
            .ok_or_else(|| McpError::UnknownServer {
                name: route.server.clone(),
            })?;
        Ok((route, conn))
    }
}

impl Default for McpAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_meta(
    ctx: &CallContext,
    session_cookie: Option<String>,
) -> Option<serde_json::Map<String, Value>> {
    let mut meta = serde_json::Map::new();
    if let Some(id) = &ctx.conversation_id {
        meta.insert("conversation_id".to_string(), Value::String(id.clone()));
    }
    if let Some(cookie) = session_cookie {
        meta.insert("session_id".to_string(), Value::String(cookie));
    }
    if meta.is_empty() { None } else { Some(meta) }
}

/// Nudge model-produced argument values toward the declared schema types.
/// Models sometimes send numbers and booleans as strings.
fn coerce_arguments(
    args: serde_json::Map<String, Value>,
    schema: &Value,
) -> serde_json::Map<String, Value> {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return args;
    };
    args.into_iter()
        .map(|(key, value)| {
            let coerced = match properties.get(&key) {
                Some(prop_schema) => coerce_value(value, prop_schema),
                None => value,
            };
            (key, coerced)
        })
        .collect()
}

fn coerce_value(value: Value, schema: &Value) -> Value {
    match (value, schema.get("type").and_then(|t| t.as_str())) {
        (Value::String(s), Some("integer")) => match s.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(s),
        },
        (Value::String(s), Some("number")) => match s.parse::<f64>() {
            Ok(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::String(s)),
            Err(_) => Value::String(s),
        },
        (Value::String(s), Some("boolean")) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        (Value::Object(map), Some("object")) => Value::Object(coerce_arguments(map, schema)),
        (value, _) => value,
    }
}
