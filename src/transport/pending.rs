//! Request/response correlation shared by the multiplexing transports

use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, METHOD_NOT_FOUND};
use crate::core::request_id::RequestIdGenerator;
use crate::utils::errors::{McpError, McpResult};
use dashmap::DashMap;
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// In-flight requests keyed by JSON-RPC id
pub struct PendingRequests {
    map: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    ids: RequestIdGenerator,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(server: &str, timeout: Duration) -> Self {
        Self {
            map: DashMap::new(),
            ids: RequestIdGenerator::with_prefix(server),
            timeout,
        }
    }

    /// Allocate an id and the receiver its response will arrive on
    pub fn register(&self, method: &str, params: Option<serde_json::Value>) -> (JsonRpcRequest, oneshot::Receiver<JsonRpcResponse>) {
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.map.insert(id.clone(), tx);
        (JsonRpcRequest::new(id, method, params), rx)
    }

    pub fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            debug!("Received response without id, ignoring");
            return;
        };
        match self.map.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(response);
            }
            None => warn!("Received response with unknown id: {}", id),
        }
    }

    pub fn cancel(&self, id: &RequestId) {
        self.map.remove(id);
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Wait for the response to `id`, bounded by the per-request timeout.
    pub async fn wait(&self, id: &RequestId, rx: oneshot::Receiver<JsonRpcResponse>) -> McpResult<JsonRpcResponse> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::TransportError(
                "Connection closed before response arrived".to_string(),
            )),
            Err(_) => {
                self.cancel(id);
                Err(McpError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

/// Fixed reply to a server-initiated request.
///
/// Returns `None` for messages without an id, which need no reply.
pub fn answer_server_request(request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
    let id = request.id.clone()?;
    let response = match request.method.as_str() {
        "roots/list" => JsonRpcResponse::success(id, json!({ "roots": [] })),
        "ping" => JsonRpcResponse::success(id, json!({})),
        other => {
            debug!("Rejecting unsupported server request: {}", other);
            JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other))
        }
    };
    Some(response)
}
