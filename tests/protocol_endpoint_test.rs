//! Integration tests for the JSON-RPC dispatch surface
//!
//! Drives the protocol handler over a gateway backed by a real
//! shell-script MCP server, checking the front-facing contract:
//! merged prefixed tool lists, error-code mapping, and notification
//! silence.

mod common;

use common::{fake_mcp_server, gateway_config, raw_stdio};
use std::sync::Arc;
use switchboard_core::{Gateway, NullSink, ProtocolHandler};
use tempfile::TempDir;

async fn handler_over_backends(tools: &[&str]) -> (Gateway, ProtocolHandler, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut backends = Vec::new();
    let mut scripts = Vec::new();
    for tool in tools {
        scripts.push((tool.to_string(), fake_mcp_server(&dir, tool)));
    }
    for (tool, script) in &scripts {
        backends.push((tool.as_str(), raw_stdio("sh", vec![script.clone()])));
    }

    let gateway = Gateway::new(gateway_config(backends), Arc::new(NullSink));
    gateway.start().await.unwrap();
    let handler = ProtocolHandler::new(gateway.registry());
    (gateway, handler, dir)
}

#[tokio::test]
async fn tools_list_merges_with_prefixed_names() {
    let (gateway, handler, _dir) = handler_over_backends(&["clock", "files"]).await;

    let response = handler
        .handle(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
        .await
        .unwrap();

    assert!(response.error.is_none());
    let result = response.result.unwrap();
    let names: Vec<&str> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();

    assert_eq!(names.len(), 2);
    assert!(names.contains(&"clock:clock"));
    assert!(names.contains(&"files:files"));

    gateway.stop().await;
}

#[tokio::test]
async fn missing_jsonrpc_marker_is_invalid_request() {
    let (gateway, handler, _dir) = handler_over_backends(&[]).await;

    let response = handler
        .handle(r#"{"id":1,"method":"tools/list"}"#)
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32600);

    gateway.stop().await;
}

#[tokio::test]
async fn ping_notification_is_silent() {
    let (gateway, handler, _dir) = handler_over_backends(&[]).await;

    let response = handler.handle(r#"{"jsonrpc":"2.0","method":"ping"}"#).await;
    assert!(response.is_none());

    gateway.stop().await;
}

#[tokio::test]
async fn tools_call_end_to_end() {
    let (gateway, handler, _dir) = handler_over_backends(&["clock"]).await;

    let response = handler
        .handle(
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"clock:clock","arguments":{}}}"#,
        )
        .await
        .unwrap();

    assert!(response.error.is_none());
    assert_eq!(
        response.result.unwrap()["content"][0]["text"],
        "ran clock"
    );

    gateway.stop().await;
}

#[tokio::test]
async fn call_against_removed_backend_is_tool_not_found() {
    let (gateway, handler, _dir) = handler_over_backends(&["clock"]).await;

    gateway.remove_backend("clock").await.unwrap();

    let response = handler
        .handle(
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"clock:clock"}}"#,
        )
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32002);

    gateway.stop().await;
}
