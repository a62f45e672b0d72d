//! Alert worker: the single mutation point for [`AlertEngine`]
//!
//! Events arrive in detection order over one bounded channel and are applied
//! one at a time. Prevention actions run on a detached task so a slow webhook never
//! holds up the engine.

use super::{AlertDecision, AlertEngine};
use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::error::Result;
use crate::models::{ComponentHealth, DetectionEvent};
use crate::prevention::PreventionDispatcher;
use crate::realtime_hub::{AlertMessage, HubMessage, RealtimeHub};
use crate::store::PersistenceHandle;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const COMPONENT: &str = "alert";

pub struct AlertWorker {
    events: Arc<Mutex<mpsc::Receiver<Arc<DetectionEvent>>>>,
    /// Kept across restarts so pending counts and cooldown survive a crash
    engine: Arc<Mutex<AlertEngine>>,
    dispatcher: Arc<PreventionDispatcher>,
    hub: Arc<RealtimeHub>,
    persistence: PersistenceHandle,
    state: Arc<PipelineState>,
}

impl AlertWorker {
    pub fn new(
        events: mpsc::Receiver<Arc<DetectionEvent>>,
        engine: AlertEngine,
        dispatcher: Arc<PreventionDispatcher>,
        hub: Arc<RealtimeHub>,
        persistence: PersistenceHandle,
        state: Arc<PipelineState>,
    ) -> Self {
        Self {
            events: Arc::new(Mutex::new(events)),
            engine: Arc::new(Mutex::new(engine)),
            dispatcher,
            hub,
            persistence,
            state,
        }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut events = self.events.lock().await;
        let mut engine = self.engine.lock().await;

        self.state.publish_alert(engine.snapshot());
        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "watching"))
            .await;
        ctx.ready();
        tracing::info!(
            actions = self.dispatcher.actions().len(),
            "Alert worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Some(event) => self.handle(&mut engine, &event).await,
                    None => {
                        tracing::info!("Detection event channel closed");
                        return Ok(());
                    }
                },
            }
        }

        tracing::info!(pending = engine.pending_count(), "Alert worker stopped");
        Ok(())
    }

    async fn handle(&self, engine: &mut AlertEngine, event: &DetectionEvent) {
        let decision = engine.observe(event, Utc::now());
        self.state.publish_alert(engine.snapshot());

        match decision {
            AlertDecision::Fired(alert) => {
                PipelineCounters::incr(&self.state.counters.alerts_fired);
                tracing::warn!(
                    detection_count = alert.detection_count,
                    classes = ?alert.classes,
                    frame = %alert.frame_identity,
                    "ALERT: detection threshold reached"
                );

                self.persistence.alert(alert.clone());
                self.hub
                    .broadcast(&HubMessage::Alert(AlertMessage::from(&alert)))
                    .await;

                let dispatcher = self.dispatcher.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    let report = dispatcher.dispatch(&alert).await;
                    if !report.failed.is_empty() {
                        PipelineCounters::add(&state.counters.action_errors, report.failed.len() as u64);
                    }
                    tracing::debug!(
                        succeeded = report.succeeded.len(),
                        failed = report.failed.len(),
                        "Prevention actions finished"
                    );
                });
            }
            AlertDecision::Suppressed { pending_count } => {
                tracing::debug!(pending_count, "Threshold reached during cooldown, suppressed");
            }
            AlertDecision::Accumulating { pending_count } => {
                tracing::debug!(pending_count, "Accumulating detections");
            }
            AlertDecision::Ignored => {}
        }
    }
}
