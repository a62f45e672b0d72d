//! Shared pipeline state
//!
//! One `PipelineState` per run, handed to every worker at construction.
//! Workers write counters and their own health; everyone else reads
//! published snapshots.

use crate::alert_engine::AlertSnapshot;
use crate::health::SystemSnapshot;
use crate::models::ComponentHealth;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, RwLock};

/// Aggregate counters
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_ingested: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub ingestion_errors: AtomicU64,
    pub events_processed: AtomicU64,
    pub detections_total: AtomicU64,
    pub detection_errors: AtomicU64,
    pub alerts_fired: AtomicU64,
    /// Non-empty events that never reached the alert engine
    pub alerts_dropped: AtomicU64,
    pub persistence_writes: AtomicU64,
    pub persistence_retries: AtomicU64,
    pub persistence_errors: AtomicU64,
    pub persistence_dropped: AtomicU64,
    pub sink_errors: AtomicU64,
    pub action_errors: AtomicU64,
    pub health_sample_errors: AtomicU64,
    pub worker_restarts: AtomicU64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Sum of every error counter
    pub fn errors_seen(&self) -> u64 {
        [
            &self.ingestion_errors,
            &self.detection_errors,
            &self.alerts_dropped,
            &self.persistence_errors,
            &self.persistence_dropped,
            &self.sink_errors,
            &self.action_errors,
            &self.health_sample_errors,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            frames_ingested: load(&self.frames_ingested),
            frames_dropped: load(&self.frames_dropped),
            ingestion_errors: load(&self.ingestion_errors),
            events_processed: load(&self.events_processed),
            detections_total: load(&self.detections_total),
            detection_errors: load(&self.detection_errors),
            alerts_fired: load(&self.alerts_fired),
            alerts_dropped: load(&self.alerts_dropped),
            persistence_writes: load(&self.persistence_writes),
            persistence_retries: load(&self.persistence_retries),
            persistence_errors: load(&self.persistence_errors),
            persistence_dropped: load(&self.persistence_dropped),
            sink_errors: load(&self.sink_errors),
            action_errors: load(&self.action_errors),
            health_sample_errors: load(&self.health_sample_errors),
            worker_restarts: load(&self.worker_restarts),
            errors_seen: self.errors_seen(),
        }
    }
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub frames_ingested: u64,
    pub frames_dropped: u64,
    pub ingestion_errors: u64,
    pub events_processed: u64,
    pub detections_total: u64,
    pub detection_errors: u64,
    pub alerts_fired: u64,
    pub alerts_dropped: u64,
    pub persistence_writes: u64,
    pub persistence_retries: u64,
    pub persistence_errors: u64,
    pub persistence_dropped: u64,
    pub sink_errors: u64,
    pub action_errors: u64,
    pub health_sample_errors: u64,
    pub worker_restarts: u64,
    pub errors_seen: u64,
}

/// State shared by every worker of one pipeline run
pub struct PipelineState {
    pub counters: PipelineCounters,
    components: RwLock<BTreeMap<String, ComponentHealth>>,
    alert_tx: watch::Sender<AlertSnapshot>,
    system_tx: watch::Sender<SystemSnapshot>,
    started_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(initial_alert: AlertSnapshot) -> Self {
        let (alert_tx, _) = watch::channel(initial_alert);
        let (system_tx, _) = watch::channel(SystemSnapshot::default());

        Self {
            counters: PipelineCounters::default(),
            components: RwLock::new(BTreeMap::new()),
            alert_tx,
            system_tx,
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Replace a component's health report
    pub async fn report_health(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;
        let changed = components
            .get(&health.name)
            .map(|prev| prev.healthy != health.healthy)
            .unwrap_or(true);

        if changed {
            if health.healthy {
                tracing::info!(component = %health.name, message = %health.message, "Component healthy");
            } else {
                tracing::warn!(component = %health.name, message = %health.message, "Component unhealthy");
            }
        }
        components.insert(health.name.clone(), health);
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    pub async fn components(&self) -> Vec<ComponentHealth> {
        self.components.read().await.values().cloned().collect()
    }

    pub fn publish_alert(&self, snapshot: AlertSnapshot) {
        self.alert_tx.send_replace(snapshot);
    }

    pub fn alert_snapshot(&self) -> AlertSnapshot {
        self.alert_tx.borrow().clone()
    }

    pub fn subscribe_alert(&self) -> watch::Receiver<AlertSnapshot> {
        self.alert_tx.subscribe()
    }

    pub fn publish_system(&self, snapshot: SystemSnapshot) {
        self.system_tx.send_replace(snapshot);
    }

    pub fn system_snapshot(&self) -> SystemSnapshot {
        self.system_tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_engine::AlertEngine;
    use std::time::Duration;

    fn state() -> PipelineState {
        PipelineState::new(AlertEngine::new(3, Duration::from_secs(300)).snapshot())
    }

    #[test]
    fn test_errors_seen_sums_error_counters() {
        let counters = PipelineCounters::default();
        PipelineCounters::incr(&counters.detection_errors);
        PipelineCounters::add(&counters.ingestion_errors, 2);
        PipelineCounters::incr(&counters.frames_ingested);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.errors_seen, 3);
        assert_eq!(snapshot.frames_ingested, 1);
    }

    #[tokio::test]
    async fn test_health_reports_replace_previous() {
        let state = state();
        state.report_health(ComponentHealth::unhealthy("detection", "timeout")).await;
        state.report_health(ComponentHealth::healthy("detection", "ok")).await;

        let components = state.components().await;
        assert_eq!(components.len(), 1);
        assert!(components[0].healthy);
    }

    #[tokio::test]
    async fn test_published_snapshots_are_readable() {
        let state = state();
        let mut rx = state.subscribe_alert();

        let mut engine = AlertEngine::new(1, Duration::ZERO);
        engine.observe(
            &crate::models::DetectionEvent::new(
                "a.jpg",
                None,
                vec![crate::models::Detection {
                    class_name: "mosquito".into(),
                    confidence: 0.9,
                    bbox: [0.0; 4],
                    detected_at: Utc::now(),
                }],
                Utc::now(),
                Duration::ZERO,
            ),
            Utc::now(),
        );
        state.publish_alert(engine.snapshot());

        assert!(rx.has_changed().unwrap());
        assert_eq!(state.alert_snapshot().alerts_fired, 1);
        assert_eq!(state.system_snapshot(), SystemSnapshot::default());
    }
}
