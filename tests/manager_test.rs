//! Manager behavior against scripted servers

mod common;

use common::{manager_with, process_config, settle, ScriptedFactory, ServerScript};
use mcp_hub::config::McpServersConfig;
use mcp_hub::core::{ConnectionState, NoopTelemetry, SharedTelemetry};
use mcp_hub::utils::ConnectionMetrics;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn noop() -> SharedTelemetry {
    Arc::new(NoopTelemetry)
}

fn fs_factory() -> Arc<ScriptedFactory> {
    Arc::new(ScriptedFactory::new().server(
        "fs",
        ServerScript::with_tools(&["read_file", "write_file", "list_directory"])
            .resource("file:///notes/todo.txt", "buy milk"),
    ))
}

#[tokio::test]
async fn test_filesystem_server_end_to_end() {
    let factory = fs_factory();
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], noop());

    let report = manager.initialize().await.unwrap();
    assert_eq!(report.connected, vec!["fs".to_string()]);
    assert!(report.all_connected());
    assert!(manager.is_server_connected("fs"));

    let names: Vec<String> = manager
        .list_all_tools()
        .await
        .into_iter()
        .map(|t| t.qualified_name)
        .collect();
    assert_eq!(names, vec!["fs.read_file", "fs.write_file", "fs.list_directory"]);

    let result = manager
        .execute_tool("fs.read_file", json!({"path": "/tmp/a.txt"}))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.text(), r#"fs:read_file:{"path":"/tmp/a.txt"}"#);
    let metadata = result.metadata.unwrap();
    assert_eq!(metadata.server_name, "fs");
    assert_eq!(metadata.tool_name, "read_file");

    let result = manager.execute_tool("fs.list_directory", Value::Null).await;
    assert!(result.success);
    assert_eq!(result.text(), "fs:list_directory:{}");

    let status = manager.server_status("fs").await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.tools, 3);
    assert_eq!(status.resources, 1);
    assert_eq!(status.prompts, 0);
}

#[tokio::test]
async fn test_unknown_tool_lists_available_and_suggests() {
    let (manager, _) = manager_with(fs_factory(), vec![process_config("fs")], noop());
    manager.initialize().await.unwrap();

    let result = manager.execute_tool("fs.read_fil", json!({})).await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("Tool 'read_fil' not found on server 'fs'"), "{}", error);
    assert!(error.contains("read_file, write_file, list_directory"), "{}", error);
    assert!(error.contains("Did you mean 'read_file'?"), "{}", error);

    let result = manager.execute_tool("fs.completely_unrelated", json!({})).await;
    let error = result.error.unwrap();
    assert!(error.contains("Available tools"));
    assert!(!error.contains("Did you mean"), "{}", error);
}

#[tokio::test]
async fn test_unknown_server_suggests_connected_name() {
    let (manager, _) = manager_with(fs_factory(), vec![process_config("fs")], noop());
    manager.initialize().await.unwrap();

    let result = manager.execute_tool("fss.read_file", json!({})).await;
    let error = result.error.unwrap();
    assert!(error.contains("Server 'fss' not found"), "{}", error);
    assert!(error.contains("Connected servers: fs."), "{}", error);
    assert!(error.contains("Did you mean 'fs'?"), "{}", error);
}

#[tokio::test]
async fn test_tool_names_split_on_first_dot() {
    let factory = Arc::new(
        ScriptedFactory::new().server("docs", ServerScript::with_tools(&["pages.search"])),
    );
    let (manager, _) = manager_with(factory, vec![process_config("docs")], noop());
    manager.initialize().await.unwrap();

    let result = manager.execute_tool("docs.pages.search", json!({"q": "x"})).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.metadata.unwrap().tool_name, "pages.search");
}

#[tokio::test]
async fn test_initialize_settles_all_servers() {
    let factory = Arc::new(
        ScriptedFactory::new()
            .server("alpha", ServerScript::with_tools(&["a"]))
            .server("beta", ServerScript::with_tools(&["b"]))
            .server("gamma", ServerScript::with_tools(&["c"]).opens_allowed(0)),
    );
    let mut disabled = process_config("delta");
    disabled.enabled = false;
    let metrics = Arc::new(ConnectionMetrics::new());
    let (manager, _) = manager_with(
        factory.clone(),
        vec![
            process_config("alpha"),
            process_config("beta"),
            process_config("gamma"),
            process_config("missing"),
            disabled,
        ],
        metrics.clone(),
    );

    let report = manager.initialize().await.unwrap();
    assert_eq!(report.connected.len(), 2);
    assert_eq!(report.failed.len(), 2);
    let failed: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
    assert!(failed.contains(&"gamma"));
    assert!(failed.contains(&"missing"));

    assert_eq!(manager.get_connected_servers(), vec!["alpha", "beta"]);
    assert_eq!(factory.opens("delta"), 0);
    assert_eq!(metrics.connect_failures("gamma"), 1);
    assert_eq!(metrics.connect_failures("missing"), 1);
    assert_eq!(metrics.total_connects(), 2);

    let tools: Vec<String> = manager
        .list_all_tools()
        .await
        .into_iter()
        .map(|t| t.qualified_name)
        .collect();
    assert_eq!(tools, vec!["alpha.a", "beta.b"]);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_server_reconnects() {
    let factory = fs_factory();
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], noop());
    manager.initialize().await.unwrap();

    factory.crash("fs").await;
    settle().await;
    assert!(!manager.is_server_connected("fs"));
    let result = manager.execute_tool("fs.read_file", json!({})).await;
    assert!(result.error.unwrap().contains("not connected (state: reconnecting)"));

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;

    assert_eq!(factory.opens("fs"), 2);
    assert!(manager.is_server_connected("fs"));
    assert!(manager.execute_tool("fs.read_file", json!({})).await.success);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_budget() {
    let factory = Arc::new(
        ScriptedFactory::new().server("fs", ServerScript::with_tools(&["read_file"]).opens_allowed(1)),
    );
    let metrics = Arc::new(ConnectionMetrics::new());
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], metrics.clone());
    manager.initialize().await.unwrap();

    factory.crash("fs").await;
    settle().await;
    for delay_ms in [1000, 2000, 4000] {
        tokio::time::advance(Duration::from_millis(delay_ms)).await;
        settle().await;
    }

    // One initial spawn plus three reconnect attempts, then nothing.
    assert_eq!(factory.opens("fs"), 4);
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(factory.opens("fs"), 4);

    let status = manager.server_status("fs").await.unwrap();
    assert_eq!(status.state, ConnectionState::Failed);
    let result = manager.execute_tool("fs.read_file", json!({})).await;
    assert!(result.error.unwrap().contains("state: failed"));

    let snapshot = metrics.export_json();
    assert_eq!(snapshot["servers"]["fs"]["reconnect_failures"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_server_recovers_failed_connection() {
    let factory = Arc::new(
        ScriptedFactory::new().server("fs", ServerScript::with_tools(&["read_file"]).opens_allowed(1)),
    );
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], noop());
    manager.initialize().await.unwrap();

    factory.crash("fs").await;
    settle().await;
    for delay_ms in [1000, 2000, 4000] {
        tokio::time::advance(Duration::from_millis(delay_ms)).await;
        settle().await;
    }
    assert_eq!(factory.opens("fs"), 4);
    assert_eq!(manager.server_status("fs").await.unwrap().state, ConnectionState::Failed);

    factory.heal("fs");
    manager.connect_server("fs").await.unwrap();

    assert_eq!(factory.opens("fs"), 5);
    let status = manager.server_status("fs").await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(manager.is_server_connected("fs"));

    let result = manager.execute_tool("fs.read_file", json!({"path": "/a"})).await;
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_pending_reconnect_spawns_nothing() {
    let factory = fs_factory();
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], noop());
    manager.initialize().await.unwrap();

    factory.crash("fs").await;
    settle().await;
    manager.disconnect_server("fs").await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;

    assert_eq!(factory.opens("fs"), 1);
    assert!(manager.server_status("fs").await.is_none());
    assert!(manager.get_connected_servers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_repeated_failures() {
    let factory = Arc::new(
        ScriptedFactory::new().server("net", ServerScript::with_tools(&["fetch"]).failing("fetch")),
    );
    let metrics = Arc::new(ConnectionMetrics::new());
    let (manager, _) = manager_with(factory.clone(), vec![process_config("net")], metrics.clone());
    manager.initialize().await.unwrap();

    for _ in 0..5 {
        let result = manager.execute_tool("net.fetch", json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("broken pipe"));
    }
    // Each breaker failure is one call plus two retries.
    assert_eq!(factory.tool_calls(), 15);
    assert_eq!(metrics.breaker_trips("net"), 1);

    let result = manager.execute_tool("net.fetch", json!({})).await;
    let error = result.error.unwrap();
    assert!(error.contains("circuit breaker for 'net' is open"), "{}", error);
    assert_eq!(factory.tool_calls(), 15);

    manager.reset_circuit("net").unwrap();
    manager.execute_tool("net.fetch", json!({})).await;
    assert_eq!(factory.tool_calls(), 18);
}

#[tokio::test]
async fn test_tool_error_result_is_not_a_breaker_failure() {
    let factory = Arc::new(
        ScriptedFactory::new().server("git", ServerScript::with_tools(&["commit"]).erroring("commit")),
    );
    let (manager, _) = manager_with(factory.clone(), vec![process_config("git")], noop());
    manager.initialize().await.unwrap();

    for _ in 0..7 {
        let result = manager.execute_tool("git.commit", json!({"message": "wip"})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("git:commit:"));
        assert_eq!(result.content.len(), 1);
    }
    assert_eq!(factory.tool_calls(), 7);
    let status = manager.server_status("git").await.unwrap();
    assert_eq!(status.breaker.state.to_string(), "closed");
}

#[tokio::test]
async fn test_read_resource_routes_to_owner() {
    let factory = Arc::new(
        ScriptedFactory::new()
            .server("fs", ServerScript::with_tools(&["read_file"]).resource("file:///a.txt", "alpha"))
            .server("web", ServerScript::with_tools(&["fetch"]).resource("https://example.com/", "page")),
    );
    let (manager, _) = manager_with(
        factory,
        vec![process_config("web"), process_config("fs")],
        noop(),
    );
    manager.initialize().await.unwrap();

    assert_eq!(manager.read_resource("https://example.com/").await.unwrap(), "page");
    assert_eq!(manager.read_resource("file:///a.txt").await.unwrap(), "alpha");
    assert_eq!(
        manager.read_resource("file:///nope").await.unwrap_err().error_code(),
        "RESOURCE_NOT_FOUND"
    );

    let resources: Vec<String> = manager
        .list_all_resources()
        .await
        .into_iter()
        .map(|r| r.server_name)
        .collect();
    assert_eq!(resources, vec!["fs", "web"]);
    assert!(manager.list_all_prompts().await.is_empty());
}

#[tokio::test]
async fn test_reload_picks_up_new_config() {
    let factory = Arc::new(
        ScriptedFactory::new()
            .server("one", ServerScript::with_tools(&["x"]))
            .server("two", ServerScript::with_tools(&["y"])),
    );
    let (manager, provider) = manager_with(factory.clone(), vec![process_config("one")], noop());
    manager.initialize().await.unwrap();
    assert_eq!(manager.get_connected_servers(), vec!["one"]);

    provider.replace(McpServersConfig::new(vec![process_config("two")]));
    let report = manager.reload().await.unwrap();

    assert_eq!(report.connected, vec!["two".to_string()]);
    assert_eq!(manager.get_connected_servers(), vec!["two"]);
    assert!(manager.is_initialized());
}

#[tokio::test]
async fn test_connect_server_is_idempotent() {
    let factory = fs_factory();
    let (manager, _) = manager_with(factory.clone(), vec![process_config("fs")], noop());

    let (first, second) = tokio::join!(manager.connect_server("fs"), manager.connect_server("fs"));
    first.unwrap();
    second.unwrap();
    assert_eq!(manager.get_connected_servers(), vec!["fs"]);

    manager.connect_server("fs").await.unwrap();
    assert!(factory.opens("fs") <= 2);

    manager.disconnect_all().await;
    assert!(manager.get_connected_servers().is_empty());
}
