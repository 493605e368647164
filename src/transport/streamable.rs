//! Streamable HTTP transport for MCP communication
//!
//! Every JSON-RPC message is POSTed to one endpoint. The server answers with
//! either a plain `application/json` body or a `text/event-stream` whose
//! `data:` events carry messages; newline-delimited JSON is accepted too.
//! Server requests seen on a response stream are answered with a new POST.
//! The `Mcp-Session-Id` header handed out by the server is echoed on every
//! later request and the session is ended with a DELETE on close.

use crate::core::protocol::{IncomingMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::core::request_id::RequestIdGenerator;
use crate::transport::pending::answer_server_request;
use crate::transport::traits::{Transport, TransportKind};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport for MCP servers
pub struct StreamableHttpTransport {
    server: String,
    endpoint: Url,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    ids: RequestIdGenerator,
    request_timeout: Duration,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    /// Build the transport. No traffic is sent until the first request.
    pub fn new(
        server: &str,
        endpoint: &str,
        headers: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let endpoint = endpoint
            .parse::<Url>()
            .map_err(|e| McpError::connect(server, format!("Invalid URL: {}", e)))?;

        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::ConfigError(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::ConfigError(format!("Invalid header value for '{}': {}", name, e)))?;
            default_headers.insert(header, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| McpError::TransportError(e.to_string()))?;

        info!(server, "Streamable HTTP transport targeting {}", endpoint);
        Ok(Self {
            server: server.to_string(),
            endpoint,
            client,
            session_id: RwLock::new(None),
            ids: RequestIdGenerator::with_prefix(server),
            request_timeout,
            connected: AtomicBool::new(true),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn post<T: serde::Serialize>(&self, message: &T) -> McpResult<reqwest::Response> {
        let json = serde_json::to_string(message)?;
        debug!(server = %self.server, "Sending streamable request: {}", json);

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(json);
        if let Some(id) = self.session_id().await {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::TransportError(format!("Request failed: {}", e)))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write().await;
            if session.as_deref() != Some(id) {
                info!(server = %self.server, "Streamable HTTP session established: {}", id);
                *session = Some(id.to_string());
            }
        }

        if !response.status().is_success() {
            return Err(McpError::TransportError(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn exchange(&self, request: &JsonRpcRequest, id: &RequestId) -> McpResult<JsonRpcResponse> {
        let response = self.post(request).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let body: Value = response
                .json()
                .await
                .map_err(|e| McpError::TransportError(format!("Invalid response body: {}", e)))?;
            let messages = match body {
                Value::Array(items) => items,
                single => vec![single],
            };
            for message in messages {
                if let Some(found) = self.dispatch(message, id).await {
                    return Ok(found);
                }
            }
            return Err(McpError::TransportError(
                "Response body did not contain a reply".to_string(),
            ));
        }

        let sse = content_type.starts_with("text/event-stream");
        let stream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        let mut lines = BufReader::new(tokio_util::io::StreamReader::new(stream)).lines();
        let mut data = String::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| McpError::TransportError(format!("Stream read failed: {}", e)))?
        {
            let payload = if sse {
                if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                    continue;
                }
                if !line.trim().is_empty() || data.is_empty() {
                    // event:, id:, retry: and comment lines carry nothing we use
                    continue;
                }
                std::mem::take(&mut data)
            } else if line.trim().is_empty() {
                continue;
            } else {
                line
            };

            match serde_json::from_str::<Value>(&payload) {
                Ok(message) => {
                    if let Some(found) = self.dispatch(message, id).await {
                        return Ok(found);
                    }
                }
                Err(e) => warn!(server = %self.server, "Failed to parse streamed message: {}", e),
            }
        }

        if sse && !data.is_empty() {
            if let Ok(message) = serde_json::from_str::<Value>(&data) {
                if let Some(found) = self.dispatch(message, id).await {
                    return Ok(found);
                }
            }
        }

        Err(McpError::TransportError(
            "Response stream ended without a reply".to_string(),
        ))
    }

    /// Handle one streamed message; returns it when it answers `expected`.
    async fn dispatch(&self, message: Value, expected: &RequestId) -> Option<JsonRpcResponse> {
        match IncomingMessage::parse(message) {
            Ok(IncomingMessage::Response(response)) => {
                if response.id.as_ref() == Some(expected) {
                    return Some(response);
                }
                debug!(server = %self.server, "Ignoring response for another request: {:?}", response.id);
            }
            Ok(IncomingMessage::Request(request)) => {
                if let Some(reply) = answer_server_request(&request) {
                    if let Err(e) = self.post(&reply).await {
                        warn!(server = %self.server, "Failed to answer {}: {}", request.method, e);
                    }
                }
            }
            Ok(IncomingMessage::Notification(note)) => {
                debug!(server = %self.server, method = %note.method, "Server notification");
            }
            Err(e) => warn!(server = %self.server, "Failed to parse streamed message: {}", e),
        }
        None
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("Transport not connected".to_string()));
        }

        let id = self.ids.next_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);

        match tokio::time::timeout(self.request_timeout, self.exchange(&request, &id)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if !self.is_connected().await {
            return Err(McpError::TransportError("Transport not connected".to_string()));
        }
        self.post(&JsonRpcRequest::notification(method, params)).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> McpResult<()> {
        info!(server = %self.server, "Closing Streamable HTTP transport");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(id) = self.session_id.write().await.take() {
            let result = self
                .client
                .delete(self.endpoint.clone())
                .header(SESSION_HEADER, id)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if let Err(e) = result {
                debug!(server = %self.server, "Session DELETE failed: {}", e);
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }
}
