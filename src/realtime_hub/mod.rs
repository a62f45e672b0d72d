//! RealtimeHub - In-process broadcast to dashboard clients
//!
//! ## Responsibilities
//!
//! - Client connection management
//! - Detection event broadcasting (one message per processed frame)
//! - Alert and system status broadcasting
//!
//! Delivery is best-effort: every client has an unbounded channel, and a
//! client whose receiver is gone is pruned on the next broadcast.

use crate::alert_engine::Alert;
use crate::detection_worker::DetectionSink;
use crate::error::Result;
use crate::health::HealthLevel;
use crate::models::{format_timestamp, DetectionEvent};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    Detection(DetectionMessage),
    Alert(AlertMessage),
    SystemStatus(SystemStatusMessage),
}

impl HubMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Detection(_) => "detection",
            HubMessage::Alert(_) => "alert",
            HubMessage::SystemStatus(_) => "system_status",
        }
    }
}

/// Detection message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionMessage {
    pub frame: String,
    pub classes: BTreeSet<String>,
    pub confidence: f32,
    pub count: usize,
    pub image_path: Option<String>,
    pub timestamp: String,
}

impl From<&DetectionEvent> for DetectionMessage {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            frame: event.frame_identity().to_string(),
            classes: event.classes().clone(),
            confidence: event.max_confidence(),
            count: event.len(),
            image_path: event.image_path().map(str::to_string),
            timestamp: format_timestamp(event.occurred_at()),
        }
    }
}

/// Alert message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub message: String,
    pub detection_count: u64,
    pub classes: BTreeSet<String>,
    pub severity: String,
    pub timestamp: String,
}

impl From<&Alert> for AlertMessage {
    fn from(alert: &Alert) -> Self {
        Self {
            message: alert.message.clone(),
            detection_count: alert.detection_count,
            classes: alert.classes.clone(),
            severity: alert.severity.clone(),
            timestamp: format_timestamp(alert.fired_at),
        }
    }
}

/// System status message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatusMessage {
    pub level: HealthLevel,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub warnings: Vec<String>,
    pub frames_ingested: u64,
    pub detections_total: u64,
    pub alerts_fired: u64,
    pub errors_seen: u64,
    pub timestamp: String,
}

/// Client connection
struct ClientConnection {
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections
            .write()
            .await
            .insert(id, ClientConnection { tx });
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Broadcast message to all clients
    ///
    /// Returns how many clients received it.
    pub async fn broadcast(&self, message: &HubMessage) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return 0;
            }
        };

        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let connections = self.connections.read().await;
            tracing::trace!(message_type = message.kind(), client_count = connections.len(), "Broadcasting");

            for (id, conn) in connections.iter() {
                if conn.tx.send(json.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            tracing::debug!(connection_id = %id, "Pruning closed client");
            self.unregister(&id).await;
        }
        delivered
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionSink for RealtimeHub {
    fn name(&self) -> &str {
        "realtime_hub"
    }

    fn publish<'a>(&'a self, event: &'a DetectionEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.broadcast(&HubMessage::Detection(DetectionMessage::from(event)))
                .await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Detection;
    use chrono::Utc;
    use std::time::Duration;

    fn event() -> DetectionEvent {
        DetectionEvent::new(
            "frame_001.jpg",
            Some("data/captures/frame_001.jpg".into()),
            vec![Detection {
                class_name: "fly".into(),
                confidence: 0.72,
                bbox: [1.0, 2.0, 3.0, 4.0],
                detected_at: Utc::now(),
            }],
            Utc::now(),
            Duration::from_millis(12),
        )
    }

    #[tokio::test]
    async fn test_detection_message_shape() {
        let hub = RealtimeHub::new();
        let (_id, mut rx) = hub.register().await;

        hub.publish(&event()).await.unwrap();

        let raw = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "detection");
        assert_eq!(value["data"]["classes"][0], "fly");
        assert_eq!(value["data"]["image_path"], "data/captures/frame_001.jpg");
        assert!(value["data"]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_closed_clients_are_pruned() {
        let hub = RealtimeHub::new();
        let (_a, _rx_a) = hub.register().await;
        let (_b, rx_b) = hub.register().await;
        drop(rx_b);
        assert_eq!(hub.connection_count(), 2);

        let delivered = hub
            .broadcast(&HubMessage::Detection(DetectionMessage::from(&event())))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_is_noop() {
        let hub = RealtimeHub::default();
        assert!(hub.publish(&event()).await.is_ok());
        assert_eq!(hub.connection_count(), 0);
    }
}
