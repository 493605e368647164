//! One supervised server connection
//!
//! A [`ServerConnection`] lives for as long as the manager keeps the server.
//! The link underneath it is a [`Session`], which is built whole by
//! [`Session::open`] and replaced (never patched) when the supervisor
//! reconnects after a crash.

use crate::config::ServerConfig;
use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::core::client::McpClient;
use crate::core::protocol::CallToolResult;
use crate::core::retry::RetryPolicy;
use crate::core::telemetry::SharedTelemetry;
use crate::core::types::Catalog;
use crate::transport::{ChildProcess, LinkEvent, OpenedTransport, TransportFactory, TransportKind};
use crate::utils::errors::{McpError, McpResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`ServerConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Bounded exponential backoff for crash recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-connection tuning handed down by the manager
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
}

/// A live link: client, optional process, and what the server offered
pub struct Session {
    client: McpClient,
    process: parking_lot::Mutex<Option<ChildProcess>>,
    pid: Option<u32>,
    catalog: Catalog,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// Open the transport, run the handshake within `config.timeout`, then
    /// discover capabilities.
    ///
    /// On a handshake timeout the attempt is abandoned: the transport is
    /// closed and the process handle dropped, which reaps the child.
    pub async fn open(
        config: &ServerConfig,
        factory: &dyn TransportFactory,
    ) -> McpResult<(Self, mpsc::Receiver<LinkEvent>)> {
        let server = config.name.as_str();
        let startup = Duration::from_millis(config.timeout);
        let timed_out = || McpError::connect(server, format!("startup timed out after {}ms", config.timeout));
        let started = Instant::now();

        let OpenedTransport {
            transport,
            process,
            events,
        } = tokio::time::timeout(startup, factory.open(config))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| into_connect_error(server, e))?;

        let client = McpClient::new(server, transport);
        let remaining = startup.saturating_sub(started.elapsed());

        match tokio::time::timeout(remaining, client.initialize()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                abandon(&client, process).await;
                return Err(into_connect_error(server, e));
            }
            // Dropping the process handle reaps the child; a timed-out spawn is not left running.
            Err(_) => {
                warn!(server, timeout_ms = config.timeout, "Handshake timed out, abandoning attempt");
                if let Err(e) = client.close().await {
                    debug!(server, "Error closing timed-out transport: {}", e);
                }
                drop(process);
                return Err(timed_out());
            }
        }

        let catalog = match client.discover_capabilities().await {
            Ok(catalog) => catalog,
            Err(e) => {
                abandon(&client, process).await;
                return Err(into_connect_error(server, e));
            }
        };

        let pid = process.as_ref().and_then(ChildProcess::pid);
        Ok((
            Self {
                client,
                process: parking_lot::Mutex::new(process),
                pid,
                catalog,
                connected_at: Utc::now(),
            },
            events,
        ))
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn kind(&self) -> TransportKind {
        self.client.kind()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Close the client and transport, then stop the process if there is one.
    pub async fn teardown(&self) {
        if let Err(e) = self.client.close().await {
            debug!(server = %self.client.server(), "Error closing transport: {}", e);
        }
        let process = self.process.lock().take();
        if let Some(process) = process {
            process.shutdown().await;
        }
    }
}

async fn abandon(client: &McpClient, process: Option<ChildProcess>) {
    if let Err(e) = client.close().await {
        debug!(server = %client.server(), "Error closing transport: {}", e);
    }
    if let Some(process) = process {
        process.shutdown().await;
    }
}

fn into_connect_error(server: &str, e: McpError) -> McpError {
    match e {
        McpError::ConnectError { .. } => e,
        other => McpError::connect(server, other.to_string()),
    }
}

/// Point-in-time view of one server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub breaker: CircuitBreakerStats,
}

/// A server the manager holds on to, with its breaker and crash supervisor
pub struct ServerConnection {
    config: ServerConfig,
    factory: Arc<dyn TransportFactory>,
    telemetry: SharedTelemetry,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    reconnect: ReconnectPolicy,
    state: parking_lot::RwLock<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    reconnect_attempts: AtomicU32,
    cancel: CancellationToken,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnection {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
        options: ConnectionOptions,
        telemetry: SharedTelemetry,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::with_telemetry(&config.name, options.breaker, telemetry.clone());
        let retry = options.retry.with_name(config.name.clone());
        Arc::new(Self {
            config,
            factory,
            telemetry,
            breaker,
            retry,
            reconnect: options.reconnect,
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            supervisor: parking_lot::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// The current session, if any. Callers keep it alive for the length of
    /// one operation; a reconnect swaps in a new one underneath.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(server = %self.name(), from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Establish the first session and start the crash supervisor.
    pub async fn connect(self: &Arc<Self>) -> McpResult<()> {
        self.set_state(ConnectionState::Connecting);
        let started = Instant::now();

        match Session::open(&self.config, self.factory.as_ref()).await {
            Ok((session, events)) => {
                *self.session.write().await = Some(Arc::new(session));
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                self.telemetry.connect_succeeded(self.name(), started.elapsed());
                info!(server = %self.name(), elapsed_ms = started.elapsed().as_millis() as u64, "Connected");

                let handle = tokio::spawn(supervise(
                    Arc::downgrade(self),
                    events,
                    self.cancel.clone(),
                ));
                if let Some(old) = self.supervisor.lock().replace(handle) {
                    old.abort();
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.telemetry.connect_failed(self.name(), &e.to_string());
                Err(e)
            }
        }
    }

    /// `tools/call` through the breaker, with retries inside it.
    pub async fn call_tool(
        &self,
        session: &Session,
        tool: &str,
        arguments: Value,
    ) -> McpResult<CallToolResult> {
        let client = session.client();
        let arguments = &arguments;
        let retry = &self.retry;
        self.breaker
            .execute(move || retry.run(move || client.call_tool(tool, arguments.clone())))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<String> {
        let session = self.session().await.ok_or_else(|| {
            McpError::connect(self.name(), format!("not connected (state: {})", self.state()))
        })?;
        let client = session.client();
        let retry = &self.retry;
        self.breaker
            .execute(move || retry.run(move || client.read_resource(uri)))
            .await
    }

    /// Stop for good: no reconnect may start after this begins.
    pub async fn disconnect(&self) {
        self.reconnect_attempts
            .store(self.reconnect.max_attempts, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.teardown().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.telemetry.disconnected(self.name());
        info!(server = %self.name(), "Disconnected");
    }

    pub async fn status(&self) -> ServerStatus {
        let session = self.session().await;
        let catalog = session.as_ref().map(|s| s.catalog());
        ServerStatus {
            name: self.name().to_string(),
            state: self.state(),
            transport: session.as_ref().map(|s| s.kind()),
            pid: session.as_ref().and_then(|s| s.pid()),
            tools: catalog.map_or(0, |c| c.tools.len()),
            resources: catalog.map_or(0, |c| c.resources.len()),
            prompts: catalog.map_or(0, |c| c.prompts.len()),
            reconnect_attempts: self.reconnect_attempts(),
            connected_at: session.as_ref().map(|s| s.connected_at()),
            breaker: self.breaker.stats(),
        }
    }

    /// Replace a lost session. Returns the new session's events, or `None`
    /// when recovery is over (budget spent or disconnect requested).
    async fn recover(&self, event: LinkEvent, cancel: &CancellationToken) -> Option<mpsc::Receiver<LinkEvent>> {
        if cancel.is_cancelled() || self.reconnect_attempts() >= self.reconnect.max_attempts {
            return None;
        }

        warn!(server = %self.name(), %event, "Lost connection to server");
        self.set_state(ConnectionState::Reconnecting);
        self.telemetry.disconnected(self.name());

        let lost = self.session.write().await.take();
        if let Some(session) = lost {
            session.teardown().await;
        }

        loop {
            let attempt = self.reconnect_attempts();
            if attempt >= self.reconnect.max_attempts {
                if !cancel.is_cancelled() {
                    self.set_state(ConnectionState::Failed);
                    error!(
                        server = %self.name(),
                        attempts = attempt,
                        "Giving up on server after repeated reconnect failures"
                    );
                }
                return None;
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            info!(
                server = %self.name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() || self.reconnect_attempts() >= self.reconnect.max_attempts {
                return None;
            }
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

            match Session::open(&self.config, self.factory.as_ref()).await {
                Ok((session, events)) => {
                    let mut slot = self.session.write().await;
                    if cancel.is_cancelled() {
                        drop(slot);
                        session.teardown().await;
                        return None;
                    }
                    *slot = Some(Arc::new(session));
                    drop(slot);

                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.breaker.reset();
                    self.set_state(ConnectionState::Connected);
                    self.telemetry.reconnect_succeeded(self.name(), attempt);
                    info!(server = %self.name(), attempt, "Reconnected");
                    return Some(events);
                }
                Err(e) => {
                    warn!(server = %self.name(), attempt, error = %e, "Reconnect attempt failed");
                    self.telemetry.reconnect_failed(self.name(), attempt, &e.to_string());
                }
            }
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Waits for link loss and drives recovery. Holds only a weak reference
/// between events so a dropped connection ends the task.
async fn supervise(
    connection: Weak<ServerConnection>,
    mut events: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                // Links without a persistent stream never report loss.
                None => return,
            },
        };

        let Some(live) = connection.upgrade() else {
            return;
        };
        match live.recover(event, &cancel).await {
            Some(next) => events = next,
            None => return,
        }
    }
}
