use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::mcp::ping::DEFAULT_PING_THRESHOLD;

/// Default seconds between keepalive probes on persistent connections.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// How to reach one downstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a child process speaking MCP over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
}

/// Configuration for a single downstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Keep the connection alive across calls. Non-persistent servers
    /// connect, call, and disconnect per invocation.
    #[serde(default = "default_true")]
    pub persistent: bool,
    /// On a session-terminated error, reconnect and retry the call once
    /// before surfacing the failure.
    #[serde(default)]
    pub reconnect_on_disconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_threshold: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::StreamableHttp {
                url: url.into(),
                auth_token: None,
            },
            persistent: true,
            reconnect_on_disconnect: false,
            ping_interval_secs: None,
            ping_threshold: None,
        }
    }

    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            persistent: true,
            reconnect_on_disconnect: false,
            ping_interval_secs: None,
            ping_threshold: None,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.unwrap_or(DEFAULT_PING_INTERVAL_SECS))
    }

    pub fn ping_threshold(&self) -> u32 {
        self.ping_threshold.unwrap_or(DEFAULT_PING_THRESHOLD)
    }
}

/// Root configuration for one aggregator instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Execute simultaneous tool calls one at a time instead of
    /// concurrently.
    #[serde(default)]
    pub force_sequential: bool,
    /// Keepalive interval for servers that do not set their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ping_interval_secs: Option<u64>,
}

impl AggregatorConfig {
    /// Get the default config file path (~/.praxis/mcp.toml)
    pub fn default_path() -> Option<PathBuf> {
        directories::UserDirs::new().map(|dirs| dirs.home_dir().join(".praxis").join("mcp.toml"))
    }

    /// Load configuration from the default path
    pub fn load() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AggregatorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> anyhow::Result<()> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(anyhow::anyhow!("Could not determine config path")),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn add_server(&mut self, name: String, config: ServerConfig) {
        self.servers.insert(name, config);
    }

    pub fn remove_server(&mut self, name: &str) -> Option<ServerConfig> {
        self.servers.remove(name)
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// A server's config with aggregator-wide defaults filled in.
    pub fn apply_defaults(&self, config: &ServerConfig) -> ServerConfig {
        let mut config = config.clone();
        if config.ping_interval_secs.is_none() {
            config.ping_interval_secs = self.default_ping_interval_secs;
        }
        config
    }
}
