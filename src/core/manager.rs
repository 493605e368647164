//! Registry of server connections and the tool router in front of them

use crate::config::{ConfigProvider, McpServersConfig, ServerConfig};
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::connection::{
    ConnectionOptions, ConnectionState, ReconnectPolicy, ServerConnection, ServerStatus,
};
use crate::core::retry::RetryPolicy;
use crate::core::suggest::{did_you_mean, suggest};
use crate::core::telemetry::SharedTelemetry;
use crate::core::types::{Prompt, Resource, Tool, ToolInvocationResult};
use crate::transport::process::DEFAULT_SHUTDOWN_GRACE;
use crate::transport::{DefaultTransportFactory, TransportFactory};
use crate::utils::errors::{McpError, McpResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static QUALIFIED_TOOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_.-]+$").expect("valid regex"));

/// Runtime tuning for every connection the manager creates
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    /// Time a process gets between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,
    /// Per-request response timeout
    pub request_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ManagerSettings {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            reconnect: self.reconnect.clone(),
        }
    }
}

/// Outcome of [`ConnectionManager::initialize`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializeReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl InitializeReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns every [`ServerConnection`] and routes `server.tool` calls to them
pub struct ConnectionManager {
    provider: Arc<dyn ConfigProvider>,
    factory: Arc<dyn TransportFactory>,
    settings: ManagerSettings,
    telemetry: SharedTelemetry,
    connections: DashMap<String, Arc<ServerConnection>>,
    initialized: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        factory: Arc<dyn TransportFactory>,
        settings: ManagerSettings,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            provider,
            factory,
            settings,
            telemetry,
            connections: DashMap::new(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Manager over real processes and sockets
    pub fn with_default_factory(
        provider: Arc<dyn ConfigProvider>,
        settings: ManagerSettings,
        telemetry: SharedTelemetry,
    ) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(
            settings.request_timeout,
            settings.shutdown_grace,
        ));
        Self::new(provider, factory, settings, telemetry)
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Connect every enabled server concurrently and wait for all of them.
    ///
    /// One server failing never stops the others; failures are collected in
    /// the report.
    pub async fn initialize(&self) -> McpResult<InitializeReport> {
        let config = self.provider.load().await?;
        let servers: Vec<ServerConfig> = config.enabled().cloned().collect();
        info!(servers = servers.len(), "Initializing MCP connections");

        let attempts = servers.into_iter().map(|server| async move {
            let name = server.name.clone();
            (name, self.connect_with(server).await)
        });

        let mut report = InitializeReport::default();
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.connected.push(name),
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to connect to MCP server");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "MCP initialization finished"
        );
        Ok(report)
    }

    /// Connect one configured server.
    ///
    /// A live registration is left alone. One that gave up (`Failed`) or
    /// was stopped is torn down and replaced by a fresh connection.
    pub async fn connect_server(&self, name: &str) -> McpResult<()> {
        if self.has_live_connection(name).await {
            return Ok(());
        }

        let config = self.provider.load().await?;
        let server = lookup_enabled(&config, name)?.clone();
        self.connect_with(server).await
    }

    /// Evict a registration that is no longer trying to connect, then
    /// report whether a live one remains.
    async fn has_live_connection(&self, name: &str) -> bool {
        let stale = self.connections.remove_if(name, |_, connection| {
            matches!(
                connection.state(),
                ConnectionState::Failed | ConnectionState::Disconnected
            )
        });
        if let Some((_, connection)) = stale {
            debug!(server = %name, state = %connection.state(), "Replacing stale connection");
            connection.disconnect().await;
            return false;
        }
        self.connections.contains_key(name)
    }

    async fn connect_with(&self, server: ServerConfig) -> McpResult<()> {
        if self.has_live_connection(&server.name).await {
            return Ok(());
        }

        let name = server.name.clone();
        let connection = ServerConnection::new(
            server,
            self.factory.clone(),
            self.settings.connection_options(),
            self.telemetry.clone(),
        );
        connection.connect().await?;

        let loser = match self.connections.entry(name.clone()) {
            Entry::Occupied(_) => Some(connection),
            Entry::Vacant(slot) => {
                slot.insert(connection);
                None
            }
        };
        if let Some(duplicate) = loser {
            debug!(server = %name, "Concurrent connect lost the race, closing duplicate");
            duplicate.disconnect().await;
        }
        Ok(())
    }

    fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(name).map(|entry| entry.value().clone())
    }

    fn sorted_connections(&self) -> Vec<Arc<ServerConnection>> {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by(|a, b| a.name().cmp(b.name()));
        connections
    }

    /// Invoke `server.tool`. Every failure comes back as a result value.
    pub async fn execute_tool(&self, qualified_name: &str, params: Value) -> ToolInvocationResult {
        if !QUALIFIED_TOOL_NAME.is_match(qualified_name) {
            return ToolInvocationResult::failure(format!(
                "Invalid tool name format: '{}'. Expected 'server.tool' (e.g. 'filesystem.read_file')",
                qualified_name
            ));
        }
        let Some((server, tool)) = qualified_name.split_once('.') else {
            return ToolInvocationResult::failure(format!(
                "Invalid tool name format: '{}'",
                qualified_name
            ));
        };

        let arguments = match params {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            other => {
                return ToolInvocationResult::failure(format!(
                    "Tool arguments must be a JSON object, got: {}",
                    other
                ))
            }
        };

        let Some(connection) = self.connection(server) else {
            let connected = self.get_connected_servers();
            let listed = if connected.is_empty() {
                "none".to_string()
            } else {
                connected.join(", ")
            };
            let hint = did_you_mean(suggest(server, connected.iter().map(String::as_str)));
            return ToolInvocationResult::failure(format!(
                "Server '{}' not found. Connected servers: {}.{}",
                server, listed, hint
            ));
        };

        let state = connection.state();
        let session = match connection.session().await {
            Some(session) if state == ConnectionState::Connected => session,
            _ => {
                return ToolInvocationResult::failure(format!(
                    "Server '{}' is not connected (state: {})",
                    server, state
                ))
            }
        };

        if session.catalog().tool(tool).is_none() {
            let available: Vec<&str> = session.catalog().tool_names().collect();
            let hint = did_you_mean(suggest(tool, available.iter().copied()));
            return ToolInvocationResult::failure(format!(
                "Tool '{}' not found on server '{}'. Available tools: {}.{}",
                tool,
                server,
                available.join(", "),
                hint
            ));
        }

        let started = Instant::now();
        let outcome = connection.call_tool(&session, tool, arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(call) if call.is_error => {
                let message = call
                    .content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolInvocationResult {
                    success: false,
                    error: Some(if message.is_empty() {
                        format!("Tool '{}' reported an error", qualified_name)
                    } else {
                        message
                    }),
                    content: call.content,
                    metadata: None,
                }
            }
            Ok(call) => ToolInvocationResult::success(call.content),
            Err(e) => {
                warn!(server, tool, error = %e, "Tool call failed");
                ToolInvocationResult::failure(e.to_string())
            }
        }
        .with_metadata(server, tool, elapsed_ms);

        self.telemetry
            .tool_executed(server, tool, result.success, elapsed_ms);
        result
    }

    /// Read `uri` from whichever connected server lists it.
    pub async fn read_resource(&self, uri: &str) -> McpResult<String> {
        for connection in self.sorted_connections() {
            if !connection.is_connected() {
                continue;
            }
            let Some(session) = connection.session().await else {
                continue;
            };
            if session.catalog().owns_resource(uri) {
                return connection.read_resource(uri).await;
            }
        }
        Err(McpError::ResourceNotFound(uri.to_string()))
    }

    pub async fn list_all_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for connection in self.sorted_connections() {
            if let Some(session) = connection.session().await {
                tools.extend(session.catalog().tools.iter().cloned());
            }
        }
        tools
    }

    pub async fn list_all_resources(&self) -> Vec<Resource> {
        let mut resources = Vec::new();
        for connection in self.sorted_connections() {
            if let Some(session) = connection.session().await {
                resources.extend(session.catalog().resources.iter().cloned());
            }
        }
        resources
    }

    pub async fn list_all_prompts(&self) -> Vec<Prompt> {
        let mut prompts = Vec::new();
        for connection in self.sorted_connections() {
            if let Some(session) = connection.session().await {
                prompts.extend(session.catalog().prompts.iter().cloned());
            }
        }
        prompts
    }

    /// Names of servers currently in the connected state, sorted
    pub fn get_connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_server_connected(&self, name: &str) -> bool {
        self.connection(name)
            .map(|connection| connection.is_connected())
            .unwrap_or(false)
    }

    pub async fn server_status(&self, name: &str) -> Option<ServerStatus> {
        match self.connection(name) {
            Some(connection) => Some(connection.status().await),
            None => None,
        }
    }

    pub async fn all_server_status(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for connection in self.sorted_connections() {
            statuses.push(connection.status().await);
        }
        statuses
    }

    /// Administrative breaker reset
    pub fn reset_circuit(&self, name: &str) -> McpResult<()> {
        let connection = self
            .connection(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        connection.breaker().reset();
        info!(server = name, "Circuit breaker reset");
        Ok(())
    }

    pub async fn disconnect_server(&self, name: &str) -> McpResult<()> {
        let (_, connection) = self
            .connections
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        connection.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let removed: Vec<_> = names
            .iter()
            .filter_map(|name| self.connections.remove(name).map(|(_, c)| c))
            .collect();
        join_all(removed.iter().map(|connection| connection.disconnect())).await;
        self.initialized.store(false, Ordering::SeqCst);
        info!(servers = removed.len(), "Disconnected all MCP servers");
    }

    /// Drop every connection and start over from a fresh config read.
    pub async fn reload(&self) -> McpResult<InitializeReport> {
        info!("Reloading MCP server configuration");
        self.disconnect_all().await;
        self.initialize().await
    }
}

fn lookup_enabled<'a>(config: &'a McpServersConfig, name: &str) -> McpResult<&'a ServerConfig> {
    match config.get(name) {
        Some(server) if server.enabled => Ok(server),
        Some(_) => Err(McpError::ConfigError(format!("Server '{}' is disabled", name))),
        None => Err(McpError::ConfigError(format!(
            "Server '{}' not found in configuration",
            name
        ))),
    }
}
