use crate::core::protocol::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::pending::{answer_server_request, PendingRequests};
use crate::transport::traits::{LinkEvent, Transport, TransportKind};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Newline-delimited JSON-RPC over a pair of pipes, normally a child's stdio
pub struct StdioTransport {
    server: String,
    writer: Writer,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new<W, R>(
        server: &str,
        writer: W,
        reader: R,
        events: mpsc::Sender<LinkEvent>,
        request_timeout: Duration,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let writer: Writer = Arc::new(Mutex::new(Box::new(writer)));
        let pending = Arc::new(PendingRequests::new(server, request_timeout));
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            server.to_string(),
            reader,
            writer.clone(),
            pending.clone(),
            connected.clone(),
            closing.clone(),
            events,
        ));

        Self {
            server: server.to_string(),
            writer,
            pending,
            connected,
            closing,
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn write_message<T: serde::Serialize>(&self, message: &T) -> McpResult<()> {
        let json = serde_json::to_string(message)?;
        debug!(server = %self.server, "Sending: {}", json);
        write_line(&self.writer, &json).await
    }
}

async fn write_line(writer: &Writer, json: &str) -> McpResult<()> {
    let mut writer = writer.lock().await;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop<R>(
    server: String,
    reader: R,
    writer: Writer,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(server = %server, "Received: {}", line);
                match IncomingMessage::parse_line(&line) {
                    Ok(IncomingMessage::Response(response)) => pending.complete(response),
                    Ok(IncomingMessage::Request(request)) => {
                        reply(&server, &writer, &request).await;
                    }
                    Ok(IncomingMessage::Notification(note)) => {
                        debug!(server = %server, method = %note.method, "Server notification");
                    }
                    Err(e) => warn!(server = %server, "Failed to parse message: {}", e),
                }
            }
            Ok(None) => break "stdout closed".to_string(),
            Err(e) => break format!("read error: {}", e),
        }
    };

    connected.store(false, Ordering::SeqCst);
    pending.fail_all();

    if !closing.load(Ordering::SeqCst) {
        info!(server = %server, "Stdio reader ended: {}", reason);
        let _ = events.send(LinkEvent::TransportClosed { reason }).await;
    }
}

async fn reply(server: &str, writer: &Writer, request: &JsonRpcRequest) {
    let Some(response) = answer_server_request(request) else {
        return;
    };
    match serde_json::to_string(&response) {
        Ok(json) => {
            if let Err(e) = write_line(writer, &json).await {
                warn!(server, "Failed to answer {}: {}", request.method, e);
            }
        }
        Err(e) => warn!(server, "Failed to encode reply: {}", e),
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("Transport not connected".to_string()));
        }

        let (request, rx) = self.pending.register(method, params);
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpError::InvalidRequest("Missing request id".to_string()))?;

        if let Err(e) = self.write_message(&request).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        self.pending.wait(&id, rx).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("Transport not connected".to_string()));
        }
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> McpResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.fail_all();
        let _ = self.writer.lock().await.shutdown().await;
        debug!(server = %self.server, "Stdio transport closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
