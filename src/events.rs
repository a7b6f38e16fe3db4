// Event types and payload structures for real-time updates
// These are broadcast to UI subscribers over the IPC bridge

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// Event name constants
pub const EVENT_STATE_CHANGED: &str = "state:changed";
pub const EVENT_LOG_UPDATE: &str = "log:update";
pub const EVENT_ORCHESTRATOR_LOG: &str = "orchestrator:log";
pub const EVENT_WORKSPACE_LOGS_CHANGED: &str = "workspace:logsChanged";

/// Per-subscriber buffer size. A subscriber that falls further behind than
/// this loses its oldest events; publishers never block.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Payload for streamed agent output chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUpdatePayload {
    pub project_id: String,
    pub task_id: String,
    pub chunk: String,
}

/// Payload for orchestrator progress messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorLogPayload {
    pub project_id: String,
    pub message: String,
    pub timestamp: String,
}

/// Payload for workspace loop-log changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLogsChangedPayload {
    pub project_id: String,
}

/// An event envelope as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    /// Event type (e.g. "state:changed", "log:update")
    pub event: String,
    /// Event payload as a JSON value
    pub payload: serde_json::Value,
}

/// One-to-many broadcast of engine events to UI subscribers.
///
/// Backed by a bounded broadcast channel; a slow subscriber observes a
/// `Lagged` gap rather than ever stalling the engine.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Broadcast an event to all connected subscribers.
    pub fn emit(&self, event_type: &str, payload: impl Serialize) {
        let event = EngineEvent {
            event: event_type.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        };

        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    /// Subscribe to events (returns a receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(
            EVENT_ORCHESTRATOR_LOG,
            OrchestratorLogPayload {
                project_id: "p1".to_string(),
                message: "setup complete".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "orchestrator:log");
        assert_eq!(event.payload["projectId"], "p1");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        // No receivers; must not panic or block
        bus.emit(EVENT_STATE_CHANGED, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(EVENT_BUFFER_SIZE + 10) {
            bus.emit(EVENT_LOG_UPDATE, serde_json::json!({ "seq": i }));
        }

        // The first recv reports the lag, subsequent recvs deliver the
        // retained (newest) events in order.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {:?}", other),
        }
        let event = rx.recv().await.unwrap();
        assert!(event.payload["seq"].as_u64().unwrap() >= 10);
    }

    #[test]
    fn test_log_update_payload_serialization() {
        let payload = LogUpdatePayload {
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            chunk: "building...\n".to_string(),
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"projectId\":\"p1\""));
        assert!(json.contains("\"taskId\":\"t1\""));
        assert!(json.contains("\"chunk\""));
    }

    #[test]
    fn test_event_constants() {
        assert_eq!(EVENT_STATE_CHANGED, "state:changed");
        assert_eq!(EVENT_LOG_UPDATE, "log:update");
        assert_eq!(EVENT_ORCHESTRATOR_LOG, "orchestrator:log");
        assert_eq!(EVENT_WORKSPACE_LOGS_CHANGED, "workspace:logsChanged");
    }
}
