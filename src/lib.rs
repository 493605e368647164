//! mcp-hub: multi-server MCP client with crash recovery and circuit breaking

pub mod config;
pub mod core;
pub mod transport;
pub mod utils;

pub use crate::config::{ConfigProvider, FileConfigProvider, McpServersConfig, ServerConfig, StaticConfigProvider};
pub use crate::core::{ConnectionManager, InitializeReport, ManagerSettings, ToolInvocationResult};
pub use crate::utils::errors::{McpError, McpResult};
