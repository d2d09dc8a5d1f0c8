//! Service registry and tool router
//!
//! Owns the backend map and the aggregated, namespaced tool catalog.
//! This is the only component that writes either structure: every other
//! component calls through here or receives snapshots. The catalog is
//! rebuilt wholesale from the backend map under one write section, so
//! concurrent "tools changed" and "backend removed" events can never
//! interleave into a partial catalog.

use crate::connection::ServiceConnection;
use crate::error::{GatewayError, Result};
use crate::events::{EventSink, GatewayEvent};
use crate::types::{split_namespaced, ConnectionState, NamespacedTool};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The aggregated catalog plus its lookup index.
#[derive(Default)]
struct Catalog {
    tools: Vec<NamespacedTool>,
    /// visible name → (service, original) for O(1) routing.
    index: HashMap<String, (String, String)>,
}

/// Registry of backend connections and their namespaced tools.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceConnection>>>,
    catalog: RwLock<Catalog>,
    events: Arc<dyn EventSink>,
}

impl ServiceRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            catalog: RwLock::new(Catalog::default()),
            events,
        }
    }

    /// Register a backend connection.
    ///
    /// A second backend with the same name is rejected before any
    /// connection attempt so duplicate namespaces can never form.
    pub async fn add_service(&self, connection: Arc<ServiceConnection>) -> Result<()> {
        let name = connection.name().to_string();
        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            return Err(GatewayError::DuplicateBackend(name));
        }
        services.insert(name, connection);
        Ok(())
    }

    /// Remove a backend and purge its tools from the catalog.
    ///
    /// Idempotent: removing an unknown backend returns `None`.
    pub async fn remove_service(&self, name: &str) -> Option<Arc<ServiceConnection>> {
        let removed = self.services.write().await.remove(name);
        if removed.is_some() {
            self.rebuild_catalog().await;
        }
        removed
    }

    /// Look up a backend connection by name.
    pub async fn get(&self, name: &str) -> Option<Arc<ServiceConnection>> {
        self.services.read().await.get(name).cloned()
    }

    /// All registered backend names, sorted.
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered backend connections.
    pub async fn services(&self) -> Vec<Arc<ServiceConnection>> {
        self.services.read().await.values().cloned().collect()
    }

    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    /// Snapshot of the aggregated, namespaced catalog.
    pub async fn all_tools(&self) -> Vec<NamespacedTool> {
        self.catalog.read().await.tools.clone()
    }

    pub async fn tool_count(&self) -> usize {
        self.catalog.read().await.tools.len()
    }

    /// Rebuild the catalog from the current backend map.
    ///
    /// Cheap and idempotent: connected backends contribute their tools,
    /// everything else contributes nothing. Runs under a single write
    /// section so readers always observe a complete catalog.
    pub async fn rebuild_catalog(&self) {
        let services = self.services.read().await;

        let mut tools = Vec::new();
        let mut index = HashMap::new();

        // Deterministic iteration keeps the catalog stable across rebuilds
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();

        for name in names {
            let connection = &services[name];
            if connection.state().await != ConnectionState::Connected {
                continue;
            }
            for tool in connection.tools().await {
                let namespaced = NamespacedTool {
                    service_name: name.clone(),
                    original_name: tool.name.clone(),
                    tool,
                };
                let visible = namespaced.visible_name();
                if index.contains_key(&visible) {
                    warn!(tool = %visible, "duplicate tool name in backend listing, skipping");
                    continue;
                }
                index.insert(visible, (name.clone(), namespaced.original_name.clone()));
                tools.push(namespaced);
            }
        }
        drop(services);

        let total = tools.len();
        {
            let mut catalog = self.catalog.write().await;
            catalog.tools = tools;
            catalog.index = index;
        }
        debug!(total, "tool catalog rebuilt");
        self.events.emit(GatewayEvent::tools_changed(total));
    }

    /// Route a namespaced tool call to its owning backend.
    ///
    /// The backend receives the original (un-prefixed) tool name.
    pub async fn call_tool(&self, namespaced_name: &str, arguments: Value) -> Result<Value> {
        if split_namespaced(namespaced_name).is_none() {
            return Err(GatewayError::ToolNotFound(namespaced_name.to_string()));
        }

        let (service, original) = {
            let catalog = self.catalog.read().await;
            match catalog.index.get(namespaced_name) {
                Some((service, original)) => (service.clone(), original.clone()),
                None => return Err(GatewayError::ToolNotFound(namespaced_name.to_string())),
            }
        };

        let connection = self
            .get(&service)
            .await
            .ok_or_else(|| GatewayError::BackendNotFound(service.clone()))?;

        connection.call_tool(&original, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::events::NullSink;
    use crate::protocol::{JsonRpcError, JsonRpcResponse, ToolsListResult};
    use crate::transport::{Transport, TransportState};
    use crate::types::ToolDescriptor;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeTransport {
        tools: Vec<ToolDescriptor>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
            let result = match method {
                "initialize" => json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                }),
                "tools/list" => serde_json::to_value(ToolsListResult {
                    tools: self.tools.clone(),
                })
                .unwrap(),
                "tools/call" => {
                    let name = params
                        .as_ref()
                        .and_then(|p| p.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if self.tools.iter().any(|t| t.name == name) {
                        json!({"content": [{"type": "text", "text": name}]})
                    } else {
                        return Ok(JsonRpcResponse::error(
                            json!(1),
                            JsonRpcError::invalid_params(format!("unknown tool {name}")),
                        ));
                    }
                }
                other => {
                    return Ok(JsonRpcResponse::error(
                        json!(1),
                        JsonRpcError::method_not_found(other),
                    ))
                }
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

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({}),
        }
    }

    async fn connected_service(name: &str, tools: Vec<ToolDescriptor>) -> Arc<ServiceConnection> {
        let conn = Arc::new(ServiceConnection::with_transport(
            BackendConfig::stdio(name, "unused", &[]),
            Box::new(FakeTransport {
                tools,
                connected: false,
            }),
        ));
        conn.connect().await.unwrap();
        conn
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_namespace_uniqueness() {
        let registry = registry();
        registry
            .add_service(connected_service("alpha", vec![tool("run"), tool("stop")]).await)
            .await
            .unwrap();
        registry
            .add_service(connected_service("beta", vec![tool("run")]).await)
            .await
            .unwrap();
        registry.rebuild_catalog().await;

        let tools = registry.all_tools().await;
        assert_eq!(tools.len(), 3);

        let mut visible: Vec<String> = tools.iter().map(|t| t.visible_name()).collect();
        visible.sort();
        visible.dedup();
        assert_eq!(visible.len(), 3, "no two entries may share a visible name");
    }

    #[tokio::test]
    async fn test_duplicate_backend_rejected() {
        let registry = registry();
        registry
            .add_service(connected_service("alpha", vec![]).await)
            .await
            .unwrap();

        let err = registry
            .add_service(connected_service("alpha", vec![]).await)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateBackend(_)));
    }

    #[tokio::test]
    async fn test_removal_purges_catalog() {
        let registry = registry();
        registry
            .add_service(connected_service("alpha", vec![tool("run")]).await)
            .await
            .unwrap();
        registry
            .add_service(connected_service("beta", vec![tool("run")]).await)
            .await
            .unwrap();
        registry.rebuild_catalog().await;
        assert_eq!(registry.tool_count().await, 2);

        registry.remove_service("alpha").await.unwrap();

        let tools = registry.all_tools().await;
        assert_eq!(tools.len(), 1);
        assert!(tools.iter().all(|t| t.service_name != "alpha"));

        // Former tool names no longer route
        let err = registry
            .call_tool("alpha:run", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_unknown_backend_is_idempotent() {
        let registry = registry();
        assert!(registry.remove_service("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_call_tool_routes_with_original_name() {
        let registry = registry();
        registry
            .add_service(connected_service("alpha", vec![tool("run")]).await)
            .await
            .unwrap();
        registry.rebuild_catalog().await;

        let result = registry.call_tool("alpha:run", json!({})).await.unwrap();
        // The fake echoes the un-prefixed name it received
        assert_eq!(result["content"][0]["text"], "run");
    }

    #[tokio::test]
    async fn test_call_tool_unknown_prefix() {
        let registry = registry();
        let err = registry
            .call_tool("ghost:run", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_call_tool_without_separator() {
        let registry = registry();
        let err = registry.call_tool("bare_name", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_disconnected_backend_contributes_no_tools() {
        let registry = registry();
        let conn = connected_service("alpha", vec![tool("run")]).await;
        registry.add_service(conn.clone()).await.unwrap();
        registry.rebuild_catalog().await;
        assert_eq!(registry.tool_count().await, 1);

        conn.disconnect().await.unwrap();
        registry.rebuild_catalog().await;
        assert_eq!(registry.tool_count().await, 0);
    }
}
