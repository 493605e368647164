use crate::config::{RemoteKind, ServerConfig, TransportConfig};
use crate::core::protocol::JsonRpcResponse;
use crate::transport::process::ChildProcess;
use crate::utils::errors::McpResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response. The transport assigns the id.
    async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Check if transport is connected
    async fn is_connected(&self) -> bool;

    /// Close the transport and stop its background tasks
    async fn close(&self) -> McpResult<()>;

    fn kind(&self) -> TransportKind;
}

/// Which physical link a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    WebSocket,
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::StreamableHttp => write!(f, "streaming-http"),
        }
    }
}

impl TransportKind {
    /// Resolve the link type for a server config. An explicit remote hint
    /// wins; otherwise `ws`/`wss` URLs use WebSocket and everything else
    /// streaming HTTP.
    pub fn for_config(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Process { .. } => TransportKind::Stdio,
            TransportConfig::Remote {
                transport: Some(RemoteKind::Websocket),
                ..
            } => TransportKind::WebSocket,
            TransportConfig::Remote {
                transport: Some(RemoteKind::StreamingHttp),
                ..
            } => TransportKind::StreamableHttp,
            TransportConfig::Remote { url, .. } => {
                let scheme = url
                    .split_once("://")
                    .map(|(scheme, _)| scheme.to_ascii_lowercase())
                    .unwrap_or_default();
                if scheme == "ws" || scheme == "wss" {
                    TransportKind::WebSocket
                } else {
                    TransportKind::StreamableHttp
                }
            }
        }
    }
}

/// Loss of the underlying link, reported to the connection supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The server process exited without being asked to
    ProcessExited { code: Option<i32> },
    /// The transport's read side ended or failed
    TransportClosed { reason: String },
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::ProcessExited { code: Some(code) } => {
                write!(f, "process exited with code {}", code)
            }
            LinkEvent::ProcessExited { code: None } => write!(f, "process terminated by signal"),
            LinkEvent::TransportClosed { reason } => write!(f, "transport closed: {}", reason),
        }
    }
}

pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// Everything one connect attempt produces before the handshake
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub process: Option<ChildProcess>,
    pub events: LinkEvents,
}

/// Opens physical links for server configs
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, server: &ServerConfig) -> McpResult<OpenedTransport>;
}
