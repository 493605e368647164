//! MCP protocol client over one transport

use crate::core::protocol::{
    CallToolResult, InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, ReadResourceResult,
};
use crate::core::types::{Catalog, Prompt, Resource, Tool};
use crate::transport::{Transport, TransportKind};
use crate::utils::errors::McpResult;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on `nextCursor` pages followed for one list call
const MAX_LIST_PAGES: usize = 64;

/// Speaks MCP to one server. Owns nothing but the transport handle; the
/// process (if any) belongs to the session that built this client.
pub struct McpClient {
    server: String,
    transport: Arc<dyn Transport>,
}

impl McpClient {
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            server: server.into(),
            transport,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// `initialize` followed by `notifications/initialized`.
    ///
    /// Not bounded here; the caller races this against the startup timeout.
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::for_client())?;
        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        info!(
            server = %self.server,
            remote = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP handshake complete"
        );

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;
        Ok(result)
    }

    /// List tools, resources and prompts.
    ///
    /// A failed `tools/list` fails discovery. Resources and prompts are
    /// optional; a server that cannot list them gets an empty catalog.
    pub async fn discover_capabilities(&self) -> McpResult<Catalog> {
        let tools = self.list_tools().await?;

        let resources = self.list_resources().await.unwrap_or_else(|e| {
            debug!(server = %self.server, "resources/list unavailable: {}", e);
            Vec::new()
        });
        let prompts = self.list_prompts().await.unwrap_or_else(|e| {
            debug!(server = %self.server, "prompts/list unavailable: {}", e);
            Vec::new()
        });

        info!(
            server = %self.server,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "Discovered capabilities"
        );
        Ok(Catalog {
            tools,
            resources,
            prompts,
        })
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let mut tools = Vec::new();
        self.paginate("tools/list", |page: ListToolsResult| {
            tools.extend(
                page.tools
                    .into_iter()
                    .map(|def| Tool::from_definition(&self.server, def)),
            );
            page.next_cursor
        })
        .await?;
        Ok(tools)
    }

    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        let mut resources = Vec::new();
        self.paginate("resources/list", |page: ListResourcesResult| {
            resources.extend(
                page.resources
                    .into_iter()
                    .map(|def| Resource::from_definition(&self.server, def)),
            );
            page.next_cursor
        })
        .await?;
        Ok(resources)
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        let mut prompts = Vec::new();
        self.paginate("prompts/list", |page: ListPromptsResult| {
            prompts.extend(
                page.prompts
                    .into_iter()
                    .map(|def| Prompt::from_definition(&self.server, def)),
            );
            page.next_cursor
        })
        .await?;
        Ok(prompts)
    }

    /// One `tools/call` round trip. No retries at this layer.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        debug!(server = %self.server, tool = name, "Calling tool");
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// `resources/read`, returning the text parts joined by newlines
    pub async fn read_resource(&self, uri: &str) -> McpResult<String> {
        let result: ReadResourceResult =
            self.request("resources/read", Some(json!({ "uri": uri }))).await?;
        Ok(result.joined_text())
    }

    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> McpResult<T> {
        let response = self.transport.send_request(method, params).await?;
        let value = response.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    async fn paginate<P, F>(&self, method: &str, mut on_page: F) -> McpResult<()>
    where
        P: DeserializeOwned,
        F: FnMut(P) -> Option<String>,
    {
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: P = self.request(method, params).await?;
            match on_page(page) {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    warn!(server = %self.server, method, "Server repeated its cursor, stopping");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
        warn!(server = %self.server, method, "Stopped after {} pages", MAX_LIST_PAGES);
        Ok(())
    }
}
