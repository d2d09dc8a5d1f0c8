//! Gateway event types and the injected event sink
//!
//! Components that need to announce state changes (lifecycle
//! orchestrator, tool router) take an [`EventSink`] by injection rather
//! than reaching for a process-wide bus. The kinds are deliberately
//! narrow: connection state changes, catalog changes, health findings,
//! and administrative-operation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event type discriminant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    /// Backend reached connected state
    BackendConnected {
        backend: String,
        tool_count: usize,
        timestamp: DateTime<Utc>,
    },
    /// Backend disconnected (deliberately or by failure)
    BackendDisconnected {
        backend: String,
        timestamp: DateTime<Utc>,
    },
    /// Backend connect attempt failed
    BackendFailed {
        backend: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A retry was scheduled for a failed backend
    RetryScheduled {
        backend: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The aggregated tool catalog was rebuilt
    ToolsChanged {
        total_tools: usize,
        timestamp: DateTime<Utc>,
    },
    /// Health check flagged a backend
    HealthDegraded {
        backend: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Administrative operation reached a terminal state
    OperationFinished {
        operation_id: String,
        kind: String,
        target: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Event wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event ID (for deduplication)
    pub id: String,
    /// Event payload
    #[serde(flatten)]
    pub event_type: EventType,
}

impl GatewayEvent {
    /// Create new event
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
        }
    }

    /// Create backend connected event
    pub fn backend_connected(backend: String, tool_count: usize) -> Self {
        Self::new(EventType::BackendConnected {
            backend,
            tool_count,
            timestamp: Utc::now(),
        })
    }

    /// Create backend disconnected event
    pub fn backend_disconnected(backend: String) -> Self {
        Self::new(EventType::BackendDisconnected {
            backend,
            timestamp: Utc::now(),
        })
    }

    /// Create backend failed event
    pub fn backend_failed(backend: String, error: String) -> Self {
        Self::new(EventType::BackendFailed {
            backend,
            error,
            timestamp: Utc::now(),
        })
    }

    /// Create retry scheduled event
    pub fn retry_scheduled(backend: String, attempt: u32, delay_ms: u64) -> Self {
        Self::new(EventType::RetryScheduled {
            backend,
            attempt,
            delay_ms,
            timestamp: Utc::now(),
        })
    }

    /// Create tools changed event
    pub fn tools_changed(total_tools: usize) -> Self {
        Self::new(EventType::ToolsChanged {
            total_tools,
            timestamp: Utc::now(),
        })
    }

    /// Create health degraded event
    pub fn health_degraded(backend: String, reason: String) -> Self {
        Self::new(EventType::HealthDegraded {
            backend,
            reason,
            timestamp: Utc::now(),
        })
    }

    /// Create operation finished event
    pub fn operation_finished(
        operation_id: String,
        kind: String,
        target: String,
        success: bool,
    ) -> Self {
        Self::new(EventType::OperationFinished {
            operation_id,
            kind,
            target,
            success,
            timestamp: Utc::now(),
        })
    }
}

/// Sink for gateway events.
///
/// `emit` never fails from the caller's perspective; a sink with no
/// listeners simply drops the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Event broadcaster using tokio broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create new broadcaster with channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Get subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: GatewayEvent) {
        // SendError just means nobody is listening right now
        let _ = self.tx.send(event);
    }
}

/// Sink that discards everything. Used in tests and by the aggregator
/// CLI where no dashboard is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: GatewayEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = GatewayEvent::backend_connected("time".to_string(), 3);
        match event.event_type {
            EventType::BackendConnected {
                backend,
                tool_count,
                ..
            } => {
                assert_eq!(backend, "time");
                assert_eq!(tool_count, 3);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = GatewayEvent::tools_changed(12);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tools_changed\""));
        assert!(json.contains("\"total_tools\":12"));
    }

    #[tokio::test]
    async fn test_bus_broadcast() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        let event = GatewayEvent::backend_disconnected("time".to_string());
        bus.emit(event.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, event.id);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        // Must not panic or error
        bus.emit(GatewayEvent::tools_changed(0));
    }
}
