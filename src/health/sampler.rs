//! Periodic health sampling worker
//!
//! Each tick reads host resources, classifies them, checks the detector,
//! publishes a [`SystemSnapshot`], records a metrics row and pushes a status
//! message to the realtime hub. A failed read keeps the previous sample.

use super::{evaluate, HealthLevel, HealthThresholds, ResourceSampler, SystemSnapshot};
use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::detector::Detector;
use crate::error::Result;
use crate::models::{format_timestamp, ComponentHealth, Severity, SystemEvent};
use crate::realtime_hub::{HubMessage, RealtimeHub, SystemStatusMessage};
use crate::store::{MetricsSample, PersistenceHandle};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

const COMPONENT: &str = "health";
const DETECTOR_COMPONENT: &str = "detector";

pub struct HealthSampler<D> {
    sampler: Arc<Mutex<Box<dyn ResourceSampler>>>,
    thresholds: HealthThresholds,
    interval: Duration,
    detector: Arc<D>,
    check_timeout: Duration,
    persistence: PersistenceHandle,
    hub: Arc<RealtimeHub>,
    state: Arc<PipelineState>,
}

impl<D: Detector> HealthSampler<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sampler: Box<dyn ResourceSampler>,
        thresholds: HealthThresholds,
        interval: Duration,
        detector: Arc<D>,
        check_timeout: Duration,
        persistence: PersistenceHandle,
        hub: Arc<RealtimeHub>,
        state: Arc<PipelineState>,
    ) -> Self {
        Self {
            sampler: Arc::new(Mutex::new(sampler)),
            thresholds,
            interval,
            detector,
            check_timeout,
            persistence,
            hub,
            state,
        }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut sampler = self.sampler.lock().await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "sampling"))
            .await;
        ctx.ready();
        tracing::info!(interval_secs = self.interval.as_secs(), "Health sampler started");

        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    // A stalled detector check must not hold up shutdown
                    tokio::select! {
                        biased;
                        _ = ctx.shutdown.cancelled() => break,
                        _ = self.sample_once(&mut **sampler) => {}
                    }
                }
            }
        }

        tracing::info!("Health sampler stopped");
        Ok(())
    }

    /// Take one sample and publish it
    pub async fn sample_once(&self, sampler: &mut dyn ResourceSampler) -> SystemSnapshot {
        let previous = self.state.system_snapshot();

        let snapshot = match sampler.sample() {
            Ok(usage) => {
                let assessment = evaluate(&usage, &self.thresholds);
                SystemSnapshot {
                    level: assessment.level,
                    usage: Some(usage),
                    warnings: assessment.warnings,
                    last_error: None,
                }
            }
            Err(e) => {
                PipelineCounters::incr(&self.state.counters.health_sample_errors);
                tracing::warn!(error = %e, "Resource sampling failed, keeping previous sample");
                SystemSnapshot {
                    last_error: Some(e.to_string()),
                    ..previous.clone()
                }
            }
        };

        self.note_transition(previous.level, &snapshot);
        self.state.publish_system(snapshot.clone());

        self.check_detector().await;

        let counters = self.state.counters.snapshot();
        if let Some(usage) = &snapshot.usage {
            if snapshot.last_error.is_none() {
                self.persistence.metrics(MetricsSample {
                    timestamp: usage.sampled_at,
                    cpu_percent: usage.cpu_percent,
                    memory_percent: usage.memory_percent,
                    disk_percent: usage.disk_percent,
                    detection_count: counters.detections_total,
                    error_count: counters.errors_seen,
                });
            }
        }

        self.hub
            .broadcast(&HubMessage::SystemStatus(SystemStatusMessage {
                level: snapshot.level,
                cpu_percent: snapshot.usage.as_ref().map(|u| u.cpu_percent),
                memory_percent: snapshot.usage.as_ref().map(|u| u.memory_percent),
                disk_percent: snapshot.usage.as_ref().map(|u| u.disk_percent),
                warnings: snapshot.warnings.clone(),
                frames_ingested: counters.frames_ingested,
                detections_total: counters.detections_total,
                alerts_fired: counters.alerts_fired,
                errors_seen: counters.errors_seen,
                timestamp: format_timestamp(Utc::now()),
            }))
            .await;

        snapshot
    }

    fn note_transition(&self, previous: HealthLevel, snapshot: &SystemSnapshot) {
        match (previous, snapshot.level) {
            (HealthLevel::Healthy, HealthLevel::Warning) => {
                let message = snapshot.warnings.join("; ");
                tracing::warn!(warnings = %message, "Resource usage above thresholds");
                self.persistence.system_event(SystemEvent::new(
                    "resource_warning",
                    message,
                    Severity::Warning,
                ));
            }
            (HealthLevel::Warning, HealthLevel::Healthy) => {
                tracing::info!("Resource usage back under thresholds");
                self.persistence.system_event(SystemEvent::new(
                    "resource_recovered",
                    "resource usage back under thresholds",
                    Severity::Info,
                ));
            }
            _ => {}
        }
    }

    async fn check_detector(&self) {
        let health = match tokio::time::timeout(self.check_timeout, self.detector.health_check()).await {
            Ok(health) => health,
            Err(_) => ComponentHealth::unhealthy(
                DETECTOR_COMPONENT,
                format!("health check timed out after {:?}", self.check_timeout),
            ),
        };
        self.state.report_health(health).await;
    }
}
