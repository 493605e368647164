use crate::utils::errors::{McpError, McpResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Default handshake timeout in milliseconds
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

static SERVER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(ConfigFormat::Json),
            Some("yml") | Some("yaml") => Some(ConfigFormat::Yaml),
            _ => None,
        }
    }

    /// Extension first, then a peek at the content.
    pub fn detect(path: &Path, content: &str) -> Self {
        Self::from_path(path).unwrap_or_else(|| {
            if content.trim_start().starts_with('{') {
                ConfigFormat::Json
            } else {
                ConfigFormat::Yaml
            }
        })
    }
}

/// Remote transport hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteKind {
    #[serde(rename = "websocket")]
    Websocket,
    #[serde(rename = "streaming-http")]
    StreamingHttp,
}

impl RemoteKind {
    /// Parse a `transport`/`type` value. `stdio` is accepted and yields `None`.
    fn parse_hint(server: &str, hint: &str) -> McpResult<Option<Self>> {
        match hint {
            "websocket" | "ws" => Ok(Some(RemoteKind::Websocket)),
            "streaming-http" | "streamable-http" | "streamableHttp" | "http" => {
                Ok(Some(RemoteKind::StreamingHttp))
            }
            "stdio" => Ok(None),
            other => Err(McpError::ConfigError(format!(
                "Server '{}' has unknown transport '{}'",
                server, other
            ))),
        }
    }
}

/// How to reach a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Spawn a process and talk over its stdio
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// Dial a URL
    Remote {
        url: String,
        transport: Option<RemoteKind>,
        headers: HashMap<String, String>,
    },
}

/// One entry of the `mcpServers` map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub enabled: bool,
    /// Startup timeout in milliseconds
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ServerConfig {
    pub fn process(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Process {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            enabled: true,
            timeout: DEFAULT_STARTUP_TIMEOUT_MS,
            description: None,
        }
    }

    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Remote {
                url: url.into(),
                transport: None,
                headers: HashMap::new(),
            },
            enabled: true,
            timeout: DEFAULT_STARTUP_TIMEOUT_MS,
            description: None,
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(self.transport, TransportConfig::Process { .. })
    }

    /// Build from the on-disk shape, enforcing exactly one of `command`/`url`.
    fn from_raw(name: &str, raw: RawServerConfig) -> McpResult<Self> {
        validate_server_name(name)?;

        let hint = raw
            .transport
            .as_deref()
            .map(|h| RemoteKind::parse_hint(name, h))
            .transpose()?;

        let transport = match (raw.command, raw.url) {
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(McpError::ConfigError(format!(
                        "Server '{}' has an empty command",
                        name
                    )));
                }
                TransportConfig::Process {
                    command,
                    args: raw.args,
                    env: raw.env,
                }
            }
            (None, Some(url)) => {
                if hint == Some(None) {
                    return Err(McpError::ConfigError(format!(
                        "Server '{}' has a 'url' but asks for the stdio transport",
                        name
                    )));
                }
                TransportConfig::Remote {
                    url,
                    transport: hint.flatten(),
                    headers: raw.headers,
                }
            }
            (Some(_), Some(_)) => {
                return Err(McpError::ConfigError(format!(
                    "Server '{}' sets both 'command' and 'url'; pick one",
                    name
                )))
            }
            (None, None) => {
                return Err(McpError::ConfigError(format!(
                    "Server '{}' needs either 'command' or 'url'",
                    name
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            transport,
            enabled: raw.enabled,
            timeout: raw.timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
            description: raw.description,
        })
    }
}

/// Server names become the prefix of qualified tool names, so no dots.
pub fn validate_server_name(name: &str) -> McpResult<()> {
    if SERVER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(McpError::ConfigError(format!(
            "Invalid server name '{}': use letters, digits, '_' or '-'",
            name
        )))
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    url: Option<String>,
    #[serde(default, alias = "type")]
    transport: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    timeout: Option<u64>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, RawServerConfig>,
}

/// Parsed `{ "mcpServers": { ... } }` document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpServersConfig {
    pub servers: BTreeMap<String, ServerConfig>,
}

impl McpServersConfig {
    pub fn new(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn parse(content: &str, format: ConfigFormat) -> McpResult<Self> {
        let raw: RawDocument = match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| McpError::ConfigError(format!("Failed to parse JSON config: {}", e)))?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| McpError::ConfigError(format!("Failed to parse YAML config: {}", e)))?,
        };
        Self::from_raw(raw)
    }

    pub fn from_value(value: serde_json::Value) -> McpResult<Self> {
        let raw: RawDocument = serde_json::from_value(value)
            .map_err(|e| McpError::ConfigError(format!("Invalid config: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDocument) -> McpResult<Self> {
        let servers = raw
            .mcp_servers
            .into_iter()
            .map(|(name, cfg)| ServerConfig::from_raw(&name, cfg).map(|s| (name, s)))
            .collect::<McpResult<BTreeMap<_, _>>>()?;
        Ok(Self { servers })
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Enabled servers in name order
    pub fn enabled(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values().filter(|s| s.enabled)
    }
}
