//! Connection registry: one `ServerConnection` per attached server, with
//! health accounting and the keepalive loop for persistent connections.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::mcp::config::ServerConfig;
use crate::mcp::metrics::{ChannelMetrics, ChannelSnapshot};
use crate::mcp::ping::PingFailureTracker;
use crate::mcp::transport::{Connector, Discovery, ServerHandle};

/// How long a keepalive probe may take before it counts as a failure.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Health accounting for one server: request outcomes plus the keepalive
/// failure tracker. Shared between the call path and the ping loop.
#[derive(Debug)]
pub struct ServerHealth {
    ok_count: AtomicU64,
    fail_count: AtomicU64,
    inner: std::sync::Mutex<HealthInner>,
}

#[derive(Debug)]
struct HealthInner {
    tracker: PingFailureTracker,
    last_ok_at: Option<DateTime<Utc>>,
    last_fail_at: Option<DateTime<Utc>>,
}

impl ServerHealth {
    pub fn new(ping_threshold: u32) -> Self {
        Self {
            ok_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            inner: std::sync::Mutex::new(HealthInner {
                tracker: PingFailureTracker::new(ping_threshold),
                last_ok_at: None,
                last_fail_at: None,
            }),
        }
    }

    pub fn record_ok(&self) {
        self.ok_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_ok_at = Some(Utc::now());
    }

    pub fn record_fail(&self) {
        self.fail_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_fail_at = Some(Utc::now());
    }

    /// Record one keepalive failure. Returns the new consecutive count and
    /// whether the threshold was reached (the tracker resets itself then).
    pub fn record_ping_failure(&self) -> (u32, bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_fail_at = Some(Utc::now());
        inner.tracker.record_failure()
    }

    pub fn record_ping_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_ok_at = Some(Utc::now());
        inner.tracker.record_success();
    }

    pub fn consecutive_ping_failures(&self) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tracker.consecutive_failures()
    }

    pub fn ok_count(&self) -> u64 {
        self.ok_count.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> u64 {
        self.fail_count.load(Ordering::Relaxed)
    }

    fn timestamps(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.last_ok_at, inner.last_fail_at)
    }
}

/// Point-in-time snapshot of one server for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub connected: bool,
    pub persistent: bool,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub session_cookie: Option<String>,
    pub ok_count: u64,
    pub fail_count: u64,
    pub consecutive_ping_failures: u32,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_fail_at: Option<DateTime<Utc>>,
    pub channel: ChannelSnapshot,
}

/// One attached server. For persistent servers `handle` holds the live
/// session; non-persistent servers keep `None` and connect per invocation.
pub struct ServerConnection {
    pub name: String,
    pub config: ServerConfig,
    handle: Option<Arc<dyn ServerHandle>>,
    discovery: std::sync::Mutex<Discovery>,
    pub health: Arc<ServerHealth>,
    pub metrics: Arc<ChannelMetrics>,
    session_cookie: std::sync::Mutex<Option<String>>,
    ping_guard: CancellationToken,
}

impl ServerConnection {
    pub fn new(
        name: String,
        config: ServerConfig,
        handle: Option<Arc<dyn ServerHandle>>,
        discovery: Discovery,
    ) -> Self {
        let threshold = config.ping_threshold();
        Self {
            name,
            config,
            handle,
            discovery: std::sync::Mutex::new(discovery),
            health: Arc::new(ServerHealth::new(threshold)),
            metrics: Arc::new(ChannelMetrics::new()),
            session_cookie: std::sync::Mutex::new(Some(new_cookie())),
            ping_guard: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> Option<Arc<dyn ServerHandle>> {
        self.handle.clone()
    }

    pub fn discovery(&self) -> Discovery {
        self.discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_discovery(&self, discovery: Discovery) {
        *self.discovery.lock().unwrap_or_else(|e| e.into_inner()) = discovery;
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.session_cookie
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear_session_cookie(&self) {
        self.session_cookie
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn ensure_session_cookie(&self) {
        let mut cookie = self.session_cookie.lock().unwrap_or_else(|e| e.into_inner());
        if cookie.is_none() {
            *cookie = Some(new_cookie());
        }
    }

    pub fn status(&self) -> ServerStatus {
        let discovery = self.discovery();
        let (last_ok_at, last_fail_at) = self.health.timestamps();
        ServerStatus {
            connected: self.handle.is_some(),
            persistent: self.config.persistent,
            tool_count: discovery.tools.len(),
            resource_count: discovery.resources.len(),
            prompt_count: discovery.prompts.len(),
            session_cookie: self.session_cookie(),
            ok_count: self.health.ok_count(),
            fail_count: self.health.fail_count(),
            consecutive_ping_failures: self.health.consecutive_ping_failures(),
            last_ok_at,
            last_fail_at,
            channel: self.metrics.snapshot(),
        }
    }

    /// Spawn the keepalive loop for a persistent connection. The loop stops
    /// when the guard is cancelled or the handle is gone.
    pub fn start_ping_loop(self: &Arc<Self>) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let conn = Arc::clone(self);
        let guard = self.ping_guard.clone();
        let interval = self.config.ping_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the connection was just
            // probed by the handshake, so skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = guard.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match handle.ping(PING_TIMEOUT).await {
                    Ok(()) => {
                        conn.health.record_ping_success();
                        conn.ensure_session_cookie();
                    }
                    Err(e) => {
                        let (count, hit_threshold) = conn.health.record_ping_failure();
                        warn!(
                            server = %conn.name,
                            consecutive = count,
                            error = %e,
                            "keepalive probe failed"
                        );
                        if hit_threshold {
                            info!(
                                server = %conn.name,
                                "ping failure threshold reached, session cookie cleared"
                            );
                            conn.clear_session_cookie();
                        }
                    }
                }
            }
            debug!(server = %conn.name, "keepalive loop stopped");
        });
    }

    /// Cancel the ping loop and close the session if one is open.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.ping_guard.cancel();
        if let Some(handle) = &self.handle {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

fn new_cookie() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Owns every attached server. Lives inside the aggregator's state lock;
/// the aggregator serializes mutation, so no interior lock here.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    servers: HashMap<String, Arc<ServerConnection>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            servers: HashMap::new(),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<ServerConnection>> {
        self.servers.values()
    }

    pub fn insert(&mut self, connection: Arc<ServerConnection>) {
        self.servers.insert(connection.name.clone(), connection);
    }

    /// Remove a server and close its session.
    pub async fn remove(&mut self, name: &str) -> Result<bool, McpError> {
        match self.servers.remove(name) {
            Some(conn) => {
                conn.shutdown().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn shutdown_all(&mut self) {
        for (name, conn) in self.servers.drain() {
            if let Err(e) = conn.shutdown().await {
                warn!(server = %name, error = %e, "shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FailNextPings, MockHandle};

    fn stdio_config(ping_secs: u64, threshold: u32) -> ServerConfig {
        let mut config = ServerConfig::stdio("mcp-server", vec![]);
        config.ping_interval_secs = Some(ping_secs);
        config.ping_threshold = Some(threshold);
        config
    }

    #[test]
    fn status_reflects_discovery_counts() {
        let discovery = Discovery {
            tools: vec![crate::mcp::testing::tool("search")],
            ..Default::default()
        };
        let conn = ServerConnection::new(
            "docs".into(),
            stdio_config(30, 3),
            Some(Arc::new(MockHandle::default())),
            discovery,
        );
        let status = conn.status();
        assert!(status.connected);
        assert!(status.persistent);
        assert_eq!(status.tool_count, 1);
        assert_eq!(status.resource_count, 0);
        assert!(status.session_cookie.is_some());
    }

    #[test]
    fn health_counts_outcomes() {
        let health = ServerHealth::new(3);
        health.record_ok();
        health.record_ok();
        health.record_fail();
        assert_eq!(health.ok_count(), 2);
        assert_eq!(health.fail_count(), 1);
        let (ok, fail) = health.timestamps();
        assert!(ok.is_some());
        assert!(fail.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_threshold_clears_session_cookie() {
        let handle = Arc::new(MockHandle::default().with_ping(FailNextPings::new(2)));
        let conn = Arc::new(ServerConnection::new(
            "docs".into(),
            stdio_config(1, 2),
            Some(handle),
            Discovery::default(),
        ));
        assert!(conn.session_cookie().is_some());
        conn.start_ping_loop();

        // Two failed probes reach the threshold of two.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(conn.session_cookie().is_none());

        // The next probe succeeds and re-mints the cookie.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(conn.session_cookie().is_some());

        conn.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ping_counter_resets_after_crossing_the_threshold() {
        let handle = Arc::new(MockHandle::default().with_ping(FailNextPings::new(5)));
        let conn = Arc::new(ServerConnection::new(
            "docs".into(),
            stdio_config(1, 3),
            Some(handle),
            Discovery::default(),
        ));
        conn.start_ping_loop();

        // Three failures cross the threshold and zero the counter.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(conn.session_cookie().is_none());
        assert_eq!(conn.health.consecutive_ping_failures(), 0);

        // Failures four and five count from scratch.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(conn.health.consecutive_ping_failures(), 2);

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remove_shuts_down_the_handle() {
        let handle = Arc::new(MockHandle::default());
        let conn = Arc::new(ServerConnection::new(
            "docs".into(),
            stdio_config(30, 3),
            Some(handle.clone()),
            Discovery::default(),
        ));
        let mut registry =
            ConnectionRegistry::new(Arc::new(crate::mcp::testing::MockConnector::default()));
        registry.insert(conn);
        assert!(registry.contains("docs"));
        assert!(registry.remove("docs").await.unwrap());
        assert!(!registry.contains("docs"));
        assert_eq!(handle.shutdown_count(), 1);
        assert!(!registry.remove("docs").await.unwrap());
    }
}
