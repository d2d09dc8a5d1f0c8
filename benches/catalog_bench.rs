//! Benchmarks for aggregated catalog rebuilds
//!
//! The catalog is rebuilt wholesale on every backend change, so the
//! rebuild has to stay cheap even with many backends and tools.

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use switchboard_core::protocol::{JsonRpcResponse, ToolsListResult};
use switchboard_core::registry::ServiceRegistry;
use switchboard_core::transport::{Transport, TransportState};
use switchboard_core::{BackendConfig, NullSink, Result, ServiceConnection, ToolDescriptor};

struct StaticTransport {
    tools: Vec<ToolDescriptor>,
    connected: bool,
}

#[async_trait]
impl Transport for StaticTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn request(&self, method: &str, _params: Option<Value>) -> Result<JsonRpcResponse> {
        let result = match method {
            "initialize" => json!({"protocolVersion": "2025-03-26", "capabilities": {}}),
            "tools/list" => serde_json::to_value(ToolsListResult {
                tools: self.tools.clone(),
            })
            .unwrap(),
            _ => json!({}),
        };
        Ok(JsonRpcResponse::success(json!(1), result))
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn state(&self) -> TransportState {
        if self.connected {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}

fn tools_for(backend: usize, count: usize) -> Vec<ToolDescriptor> {
    (0..count)
        .map(|i| ToolDescriptor {
            name: format!("tool_{backend}_{i}"),
            description: format!("synthetic tool {i} of backend {backend}"),
            input_schema: json!({"type": "object", "properties": {"arg": {"type": "string"}}}),
        })
        .collect()
}

async fn registry_with(backends: usize, tools_per_backend: usize) -> ServiceRegistry {
    let registry = ServiceRegistry::new(Arc::new(NullSink));
    for b in 0..backends {
        let connection = Arc::new(ServiceConnection::with_transport(
            BackendConfig::stdio(&format!("backend_{b}"), "unused", &[]),
            Box::new(StaticTransport {
                tools: tools_for(b, tools_per_backend),
                connected: false,
            }),
        ));
        connection.connect().await.unwrap();
        registry.add_service(connection).await.unwrap();
    }
    registry
}

fn bench_rebuild(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("catalog_rebuild");
    for (backends, tools) in [(4, 8), (16, 16), (64, 32)] {
        let registry = rt.block_on(registry_with(backends, tools));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{backends}x{tools}")),
            &registry,
            |b, registry| {
                b.iter(|| rt.block_on(registry.rebuild_catalog()));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_rebuild);
criterion_main!(benches);
