//! Scripted in-memory MCP servers for driving the manager without processes

#![allow(dead_code)]

use async_trait::async_trait;
use mcp_hub::config::{McpServersConfig, ServerConfig, StaticConfigProvider};
use mcp_hub::core::protocol::{JsonRpcResponse, RequestId};
use mcp_hub::core::{ConnectionManager, ManagerSettings, SharedTelemetry};
use mcp_hub::transport::{LinkEvent, OpenedTransport, Transport, TransportFactory, TransportKind};
use mcp_hub::{McpError, McpResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What one fake server offers and how it misbehaves
#[derive(Clone, Default)]
pub struct ServerScript {
    pub tools: Vec<String>,
    /// `(uri, text)` pairs
    pub resources: Vec<(String, String)>,
    /// Opens beyond this many fail; `None` means unlimited
    pub successful_opens: Option<u32>,
    /// Tools whose calls fail with a transport error
    pub failing_tools: Vec<String>,
    /// Tools whose calls come back with `isError: true`
    pub erroring_tools: Vec<String>,
}

impl ServerScript {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn resource(mut self, uri: &str, text: &str) -> Self {
        self.resources.push((uri.to_string(), text.to_string()));
        self
    }

    pub fn opens_allowed(mut self, count: u32) -> Self {
        self.successful_opens = Some(count);
        self
    }

    pub fn failing(mut self, tool: &str) -> Self {
        self.failing_tools.push(tool.to_string());
        self
    }

    pub fn erroring(mut self, tool: &str) -> Self {
        self.erroring_tools.push(tool.to_string());
        self
    }
}

struct ScriptedTransport {
    server: String,
    script: ServerScript,
    tool_calls: Arc<AtomicU32>,
    open: AtomicBool,
}

impl ScriptedTransport {
    fn answer(&self, method: &str, params: Option<&Value>) -> McpResult<Value> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": format!("{}-server", self.server), "version": "1.0.0"}
            })),
            "tools/list" => Ok(json!({
                "tools": self.script.tools.iter().map(|name| json!({
                    "name": name,
                    "description": format!("{} on {}", name, self.server),
                    "inputSchema": {"type": "object", "properties": {}}
                })).collect::<Vec<_>>()
            })),
            "resources/list" => Ok(json!({
                "resources": self.script.resources.iter().map(|(uri, _)| json!({
                    "uri": uri,
                    "name": uri.rsplit('/').next().unwrap_or(uri),
                    "mimeType": "text/plain"
                })).collect::<Vec<_>>()
            })),
            "resources/read" => {
                let uri = params.and_then(|p| p["uri"].as_str()).unwrap_or_default();
                let text = self
                    .script
                    .resources
                    .iter()
                    .find(|(u, _)| u == uri)
                    .map(|(_, text)| text.clone())
                    .ok_or_else(|| McpError::Rpc {
                        code: -32002,
                        message: format!("unknown resource {}", uri),
                    })?;
                Ok(json!({"contents": [{"uri": uri, "text": text}]}))
            }
            "tools/call" => {
                self.tool_calls.fetch_add(1, Ordering::SeqCst);
                let params = params.cloned().unwrap_or(Value::Null);
                let name = params["name"].as_str().unwrap_or_default().to_string();
                if self.script.failing_tools.contains(&name) {
                    return Err(McpError::TransportError("broken pipe".to_string()));
                }
                let is_error = self.script.erroring_tools.contains(&name);
                Ok(json!({
                    "content": [{"type": "text", "text": format!("{}:{}:{}", self.server, name, params["arguments"])}],
                    "isError": is_error
                }))
            }
            _ => Err(McpError::Rpc {
                code: -32601,
                message: format!("Method not found: {}", method),
            }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        let id = RequestId::String(format!("{}-1", self.server));
        match self.answer(method, params.as_ref()) {
            Ok(result) => Ok(JsonRpcResponse::success(id, result)),
            Err(McpError::Rpc { code, message }) => Ok(JsonRpcResponse::error(id, code, message)),
            Err(e) => Err(e),
        }
    }

    async fn send_notification(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> McpResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Opens scripted links by server name and counts every open
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, ServerScript>>,
    opens: Mutex<HashMap<String, u32>>,
    links: Mutex<HashMap<String, mpsc::Sender<LinkEvent>>>,
    tool_calls: Arc<AtomicU32>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, name: &str, script: ServerScript) -> Self {
        self.scripts.get_mut().insert(name.to_string(), script);
        self
    }

    /// Lift the open limit on `name` so later spawns succeed again.
    pub fn heal(&self, name: &str) {
        if let Some(script) = self.scripts.lock().get_mut(name) {
            script.successful_opens = None;
        }
    }

    pub fn opens(&self, name: &str) -> u32 {
        self.opens.lock().get(name).copied().unwrap_or(0)
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls.load(Ordering::SeqCst)
    }

    /// Report the latest link of `name` as a crashed process.
    pub async fn crash(&self, name: &str) {
        let tx = self.links.lock().get(name).cloned().expect("server was opened");
        tx.send(LinkEvent::ProcessExited { code: Some(1) })
            .await
            .expect("supervisor is listening");
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn open(&self, server: &ServerConfig) -> McpResult<OpenedTransport> {
        let attempt = {
            let mut opens = self.opens.lock();
            let count = opens.entry(server.name.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let script = self
            .scripts
            .lock()
            .get(&server.name)
            .cloned()
            .ok_or_else(|| McpError::connect(&server.name, "command 'missing-server' not found"))?;
        if script.successful_opens.is_some_and(|limit| attempt > limit) {
            return Err(McpError::connect(&server.name, "process exited during startup"));
        }

        let (tx, events) = mpsc::channel(4);
        self.links.lock().insert(server.name.clone(), tx);
        Ok(OpenedTransport {
            transport: Arc::new(ScriptedTransport {
                server: server.name.clone(),
                script,
                tool_calls: self.tool_calls.clone(),
                open: AtomicBool::new(true),
            }),
            process: None,
            events,
        })
    }
}

pub fn process_config(name: &str) -> ServerConfig {
    ServerConfig::process(name, format!("mcp-{}", name), vec![])
}

pub fn manager_with(
    factory: Arc<ScriptedFactory>,
    servers: Vec<ServerConfig>,
    telemetry: SharedTelemetry,
) -> (ConnectionManager, Arc<StaticConfigProvider>) {
    let provider = Arc::new(StaticConfigProvider::new(McpServersConfig::new(servers)));
    let manager = ConnectionManager::new(
        provider.clone(),
        factory,
        ManagerSettings::default(),
        telemetry,
    );
    (manager, provider)
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
