//! Integration tests for gateway startup, failure isolation, and
//! removal cleanup
//!
//! These drive the public gateway API against real child processes:
//! a shell-script MCP server for the healthy path and a nonexistent
//! binary for the failing one.

mod common;

use common::{fake_mcp_server, gateway_config, raw_stdio, script_backend};
use std::sync::Arc;
use switchboard_core::{ConnectionState, EventBus, Gateway, GatewayError, NullSink};
use tempfile::TempDir;

#[tokio::test]
async fn startup_isolates_failing_backend() {
    let dir = TempDir::new().unwrap();
    let script = fake_mcp_server(&dir, "echo");

    // A is a working stdio backend, B's command does not exist
    let config = gateway_config(vec![
        ("a", raw_stdio("sh", vec![script.clone()])),
        ("b", raw_stdio("this-binary-does-not-exist-xyz", vec![])),
    ]);

    let gateway = Gateway::new(config, Arc::new(NullSink));
    let report = gateway.start().await.unwrap();

    // One backend failing must not prevent the other from connecting,
    // and the overall start must still complete
    assert_eq!(report.connected, vec!["a".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b");

    // A's tools are present and prefixed; B contributes nothing
    let tools = gateway.all_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].visible_name(), "a:echo");

    // B sits in the failed set with a retry scheduled
    let stats = gateway.retry_stats().await;
    assert_eq!(stats.failed_services, vec!["b".to_string()]);
    assert_eq!(stats.attempts.get("b"), Some(&1));

    gateway.stop().await;
}

#[tokio::test]
async fn tool_call_round_trip() {
    let dir = TempDir::new().unwrap();
    let script = fake_mcp_server(&dir, "echo");

    let config = gateway_config(vec![("a", raw_stdio("sh", vec![script]))]);
    let gateway = Gateway::new(config, Arc::new(EventBus::default()));
    gateway.start().await.unwrap();

    let result = gateway
        .call_tool("a:echo", serde_json::json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ran echo");

    // Unknown suffix on a known backend fails with tool-not-found
    let err = gateway
        .call_tool("a:missing", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ToolNotFound(_)));

    gateway.stop().await;
}

#[tokio::test]
async fn removal_purges_tools_and_routing() {
    let dir = TempDir::new().unwrap();
    let script_a = fake_mcp_server(&dir, "alpha");
    let script_b = fake_mcp_server(&dir, "beta");

    let config = gateway_config(vec![
        ("a", raw_stdio("sh", vec![script_a])),
        ("b", raw_stdio("sh", vec![script_b])),
    ]);
    let gateway = Gateway::new(config, Arc::new(NullSink));
    gateway.start().await.unwrap();
    assert_eq!(gateway.all_tools().await.len(), 2);

    gateway.remove_backend("a").await.unwrap();

    let tools = gateway.all_tools().await;
    assert_eq!(tools.len(), 1);
    assert!(tools.iter().all(|t| t.service_name != "a"));

    let err = gateway
        .call_tool("a:alpha", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ToolNotFound(_)));

    // Removing again is a no-op
    gateway.remove_backend("a").await.unwrap();

    gateway.stop().await;
}

#[tokio::test]
async fn disconnect_is_idempotent_through_the_gateway() {
    let dir = TempDir::new().unwrap();
    let script = fake_mcp_server(&dir, "echo");

    let config = gateway_config(vec![("a", raw_stdio("sh", vec![script]))]);
    let gateway = Gateway::new(config, Arc::new(NullSink));
    gateway.start().await.unwrap();

    let status = gateway.disconnect_backend("a").await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);

    // Second disconnect: same end state, no error
    let status = gateway.disconnect_backend("a").await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);

    // Its tools are gone from the catalog while disconnected
    assert!(gateway.all_tools().await.is_empty());

    gateway.stop().await;
}

#[tokio::test]
async fn reconnect_restores_catalog() {
    let dir = TempDir::new().unwrap();
    let script = fake_mcp_server(&dir, "echo");

    let config = gateway_config(vec![("a", raw_stdio("sh", vec![script]))]);
    let gateway = Gateway::new(config, Arc::new(NullSink));
    gateway.start().await.unwrap();

    gateway.disconnect_backend("a").await.unwrap();
    assert!(gateway.all_tools().await.is_empty());

    let status = gateway.connect_backend("a").await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(gateway.all_tools().await.len(), 1);

    gateway.stop().await;
}

#[tokio::test]
async fn add_backend_at_runtime() {
    let gateway = Gateway::new(gateway_config(vec![]), Arc::new(NullSink));
    gateway.start().await.unwrap();
    assert!(gateway.all_tools().await.is_empty());

    let dir = TempDir::new().unwrap();
    let script = fake_mcp_server(&dir, "late");

    let status = gateway
        .add_backend(script_backend("late", &script))
        .await
        .unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.tool_count, 1);

    let tools = gateway.all_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].visible_name(), "late:late");

    gateway.stop().await;
}
