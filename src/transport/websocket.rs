//! WebSocket transport for MCP communication
//!
//! One JSON-RPC message per text frame. A writer task owns the sink; a
//! reader task routes responses to waiters and answers server requests.

use crate::core::protocol::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::pending::{answer_server_request, PendingRequests};
use crate::transport::traits::{LinkEvent, Transport, TransportKind};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// WebSocket transport for MCP servers
pub struct WebSocketTransport {
    server: String,
    url: Url,
    write_tx: mpsc::Sender<Message>,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Dial `url`, sending `headers` on the upgrade request.
    pub async fn connect(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        events: mpsc::Sender<LinkEvent>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let url = url
            .parse::<Url>()
            .map_err(|e| McpError::connect(server, format!("Invalid URL: {}", e)))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| McpError::connect(server, format!("Invalid WebSocket request: {}", e)))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::ConfigError(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::ConfigError(format!("Invalid header value for '{}': {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }

        info!(server, "Connecting to WebSocket: {}", url);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| McpError::connect(server, format!("WebSocket connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (write_tx, mut write_rx) = mpsc::channel::<Message>(100);
        let pending = Arc::new(PendingRequests::new(server, request_timeout));
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let writer = {
            let server = server.to_string();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(msg) = write_rx.recv().await {
                    let is_close = matches!(msg, Message::Close(_));
                    if let Err(e) = write.send(msg).await {
                        error!(server = %server, "WebSocket send error: {}", e);
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                connected.store(false, Ordering::SeqCst);
            })
        };

        let reader = {
            let server = server.to_string();
            let pending = pending.clone();
            let connected = connected.clone();
            let closing = closing.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => {
                            debug!(server = %server, "WebSocket received: {}", text.as_str());
                            handle_frame(&server, text.as_str(), &pending, &write_tx).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break format!("closed by peer: {:?}", frame);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("read error: {}", e),
                        None => break "stream ended".to_string(),
                    }
                };

                connected.store(false, Ordering::SeqCst);
                pending.fail_all();
                if !closing.load(Ordering::SeqCst) {
                    info!(server = %server, "WebSocket reader ended: {}", reason);
                    let _ = events.send(LinkEvent::TransportClosed { reason }).await;
                }
            })
        };

        info!(server, "WebSocket transport connected");
        Ok(Self {
            server: server.to_string(),
            url,
            write_tx,
            pending,
            connected,
            closing,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send_text(&self, json: String) -> McpResult<()> {
        debug!(server = %self.server, "WebSocket sending: {}", json);
        self.write_tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| McpError::TransportError(format!("Failed to send: {}", e)))
    }
}

async fn handle_frame(
    server: &str,
    text: &str,
    pending: &PendingRequests,
    write_tx: &mpsc::Sender<Message>,
) {
    match IncomingMessage::parse_line(text) {
        Ok(IncomingMessage::Response(response)) => pending.complete(response),
        Ok(IncomingMessage::Request(request)) => {
            if let Some(reply) = answer_server_request(&request) {
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        let _ = write_tx.send(Message::Text(json.into())).await;
                    }
                    Err(e) => warn!(server, "Failed to encode reply: {}", e),
                }
            }
        }
        Ok(IncomingMessage::Notification(note)) => {
            debug!(server, method = %note.method, "Server notification");
        }
        Err(e) => debug!(server, "Failed to parse WebSocket message: {}", e),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("WebSocket not connected".to_string()));
        }

        let (request, rx) = self.pending.register(method, params);
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpError::InvalidRequest("Missing request id".to_string()))?;

        let json = serde_json::to_string(&request)?;
        if let Err(e) = self.send_text(json).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        self.pending.wait(&id, rx).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("WebSocket not connected".to_string()));
        }
        let json = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.send_text(json).await
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> McpResult<()> {
        info!(server = %self.server, "Closing WebSocket transport");
        self.closing.store(true, Ordering::SeqCst);

        // Best effort close frame before tearing the tasks down.
        let _ = tokio::time::timeout(
            Duration::from_millis(500),
            self.write_tx.send(Message::Close(None)),
        )
        .await;

        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.pending.fail_all();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
