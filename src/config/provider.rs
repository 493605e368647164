//! Where server configs come from
//!
//! The manager re-reads its provider on every `initialize`/`reload`, so a
//! file provider picks up edits without a restart.

use crate::config::types::{ConfigFormat, McpServersConfig};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load(&self) -> McpResult<McpServersConfig>;
}

/// In-memory config, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    config: RwLock<McpServersConfig>,
}

impl StaticConfigProvider {
    pub fn new(config: McpServersConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: McpServersConfig) {
        *self.config.write() = config;
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn load(&self) -> McpResult<McpServersConfig> {
        Ok(self.config.read().clone())
    }
}

/// Reads an `mcpServers` document from disk
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    /// `~` in `path` is expanded to the home directory.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: PathBuf::from(shellexpand::tilde(path.as_ref()).to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load(&self) -> McpResult<McpServersConfig> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            McpError::ConfigError(format!("Failed to read config {}: {}", self.path.display(), e))
        })?;

        let format = ConfigFormat::detect(&self.path, &content);
        debug!("Detected config format: {:?}", format);

        let mut value: Value = match format {
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| McpError::ConfigError(format!("Failed to parse JSON config: {}", e)))?,
            ConfigFormat::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| McpError::ConfigError(format!("Failed to parse YAML config: {}", e)))?,
        };
        expand_env(&mut value);

        McpServersConfig::from_value(value)
    }
}

/// Replace `${VAR}` / `$VAR` in every string value. Unset variables are left as written.
fn expand_env(value: &mut Value) {
    match value {
        Value::String(s) => {
            let expanded =
                shellexpand::env_with_context_no_errors(s.as_str(), |var| std::env::var(var).ok());
            if expanded != s.as_str() {
                *s = expanded.into_owned();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(expand_env),
        Value::Object(map) => map.values_mut().for_each(expand_env),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ServerConfig, TransportConfig};
    use tempfile::TempDir;
    use tokio::fs;

    #[tokio::test]
    async fn test_load_mcp_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("mcp.json");
        let content = r#"{"mcpServers": {"filesystem": {"command": "uvx", "args": ["@modelcontextprotocol/server-filesystem", "/tmp"]}}}"#;
        fs::write(&config_path, content).await.unwrap();

        let provider = FileConfigProvider::new(config_path.to_string_lossy());
        let config = provider.load().await.unwrap();
        assert_eq!(config.servers.len(), 1);
        assert!(config.get("filesystem").unwrap().is_process());
    }

    #[tokio::test]
    async fn test_load_yaml_with_env_expansion() {
        std::env::set_var("MCP_HUB_PROVIDER_TEST_TOKEN", "s3cret");
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("servers.yaml");
        let content = r#"
mcpServers:
  remote:
    url: https://example.com/mcp
    headers:
      Authorization: "Bearer ${MCP_HUB_PROVIDER_TEST_TOKEN}"
      X-Missing: "${MCP_HUB_PROVIDER_TEST_UNSET}"
"#;
        fs::write(&config_path, content).await.unwrap();

        let config = FileConfigProvider::new(config_path.to_string_lossy())
            .load()
            .await
            .unwrap();
        match &config.get("remote").unwrap().transport {
            TransportConfig::Remote { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer s3cret");
                assert_eq!(headers["X-Missing"], "${MCP_HUB_PROVIDER_TEST_UNSET}");
            }
            other => panic!("expected remote transport, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let provider = FileConfigProvider::new("/definitely/not/here/mcp.json");
        let err = provider.load().await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_tilde_is_expanded() {
        let provider = FileConfigProvider::new("~/mcp.json");
        assert!(!provider.path().to_string_lossy().starts_with('~'));
    }

    #[tokio::test]
    async fn test_static_provider_replace() {
        let provider = StaticConfigProvider::new(McpServersConfig::new(vec![ServerConfig::process(
            "fs",
            "mcp-fs",
            vec![],
        )]));
        assert_eq!(provider.load().await.unwrap().servers.len(), 1);

        provider.replace(McpServersConfig::default());
        assert!(provider.load().await.unwrap().servers.is_empty());
    }
}
