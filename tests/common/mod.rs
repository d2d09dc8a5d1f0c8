//! Common test utilities and helpers

use std::collections::HashMap;
use std::io::Write;
use switchboard_core::config::RawBackendConfig;
use switchboard_core::{BackendConfig, GatewayConfig};
use tempfile::TempDir;

/// Write a minimal MCP stdio server as a shell script.
///
/// The gateway's stdio transport numbers requests per connection
/// starting at 1, so the canned responses answer id 1 (initialize),
/// then id 2 (tools/list after the initialized notification), then id 3
/// for the first tool call.
pub fn fake_mcp_server(dir: &TempDir, tool_name: &str) -> String {
    let path = dir.path().join(format!("fake-{tool_name}.sh"));
    let mut file = std::fs::File::create(&path).expect("create fake server script");
    write!(
        file,
        r#"#!/bin/sh
read req
printf '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2025-03-26","capabilities":{{}},"serverInfo":{{"name":"fake","version":"0.0.0"}}}}}}\n'
read note
read req2
printf '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"{tool_name}","description":"test tool","inputSchema":{{"type":"object"}}}}]}}}}\n'
next=3
while read line; do
  printf '{{"jsonrpc":"2.0","id":%d,"result":{{"content":[{{"type":"text","text":"ran {tool_name}"}}]}}}}\n' "$next"
  next=$((next+1))
done
"#
    )
    .expect("write fake server script");
    path.to_string_lossy().to_string()
}

/// Stdio backend config running a fake server script.
pub fn script_backend(name: &str, script: &str) -> BackendConfig {
    let mut config = BackendConfig::stdio(name, "sh", &[script]);
    config.timeout_ms = 5_000;
    config
}

/// Gateway config with the given backends and no health sweeping.
pub fn gateway_config(backends: Vec<(&str, RawBackendConfig)>) -> GatewayConfig {
    let mut map = HashMap::new();
    for (name, raw) in backends {
        map.insert(name.to_string(), raw);
    }
    GatewayConfig {
        health_check_interval_secs: 0,
        backends: map,
        ..Default::default()
    }
}

/// Raw stdio backend definition pointing at a command.
pub fn raw_stdio(command: &str, args: Vec<String>) -> RawBackendConfig {
    serde_json::from_value(serde_json::json!({
        "command": command,
        "args": args,
        "timeout_ms": 5000,
    }))
    .expect("valid raw backend config")
}
