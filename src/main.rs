use anyhow::Context;
use clap::{Parser, Subcommand};
use mcp_hub::config::FileConfigProvider;
use mcp_hub::core::{ConnectionManager, ManagerSettings, TelemetryFanout, TracingTelemetry};
use mcp_hub::utils::{init_tracing, ConnectionMetrics};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Connect to MCP servers and route tool calls to them")]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON or YAML with an `mcpServers` map)
    #[arg(short, long, env = "MCP_HUB_CONFIG")]
    config: Option<String>,
    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,
    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
    /// Print a Prometheus metrics snapshot to stderr on exit
    #[arg(long)]
    metrics: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to every enabled server and print its status
    Servers,
    /// List qualified tool names from all connected servers
    Tools,
    /// Call a tool, e.g. `call filesystem.read_file '{"path": "/tmp/x"}'`
    Call {
        tool: String,
        /// Arguments as a JSON object
        args: Option<String>,
    },
    /// Read a resource by URI
    Read { uri: String },
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-hub")
        .join("mcp.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path().to_string_lossy().into_owned());
    info!("Config file: {}", config_path);

    let metrics = Arc::new(ConnectionMetrics::new());
    let telemetry = TelemetryFanout::new()
        .with(Arc::new(TracingTelemetry))
        .with(metrics.clone());

    let manager = Arc::new(ConnectionManager::with_default_factory(
        Arc::new(FileConfigProvider::new(&config_path)),
        ManagerSettings::default(),
        Arc::new(telemetry),
    ));

    let outcome = tokio::select! {
        result = run(&manager, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down MCP servers");
            Ok(())
        }
    };

    manager.disconnect_all().await;
    if cli.metrics {
        eprint!("{}", metrics.export_prometheus());
    }
    outcome
}

async fn run(manager: &ConnectionManager, command: Command) -> anyhow::Result<()> {
    let report = manager
        .initialize()
        .await
        .context("Failed to load MCP server configuration")?;
    for (server, error) in &report.failed {
        eprintln!("warning: {}: {}", server, error);
    }

    match command {
        Command::Servers => {
            let statuses = manager.all_server_status().await;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Command::Tools => {
            for tool in manager.list_all_tools().await {
                if tool.description.is_empty() {
                    println!("{}", tool.qualified_name);
                } else {
                    println!("{}  {}", tool.qualified_name, tool.description);
                }
            }
        }
        Command::Call { tool, args } => {
            let params: Value = match args {
                Some(raw) => serde_json::from_str(&raw).context("Tool arguments are not valid JSON")?,
                None => Value::Null,
            };
            let result = manager.execute_tool(&tool, params).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!(result.error.unwrap_or_else(|| "tool call failed".to_string()));
            }
        }
        Command::Read { uri } => {
            let text = manager.read_resource(&uri).await?;
            println!("{}", text);
        }
    }

    Ok(())
}
