//! DetectionWorker - Frame to DetectionEvent
//!
//! ## Responsibilities
//!
//! - Dequeue frames one at a time and run the detector with its own timeout
//! - Build one immutable `DetectionEvent` per processed frame, empty or not
//! - Fan the event out: persistence, alert engine (non-empty only), sinks
//!
//! A detector failure skips the frame. Nothing downstream can block this
//! worker: persistence and alert hand-offs never await, and sink deliveries
//! run concurrently under the same bound as the detector call.

use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::frame_queue::{FrameReceiver, QueueEvent};
use crate::models::{ComponentHealth, DetectionEvent, Frame};
use crate::store::PersistenceHandle;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

const COMPONENT: &str = "detection";

/// Consecutive detector failures before the component reports unhealthy
const UNHEALTHY_AFTER: u32 = 3;

/// Fan-out target for detection events
///
/// Delivery is best-effort; an error or a delivery that outlives the
/// detector timeout is counted and logged, never retried.
pub trait DetectionSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn publish<'a>(&'a self, event: &'a DetectionEvent) -> BoxFuture<'a, Result<()>>;
}

/// Runs the detector over queued frames
pub struct DetectionWorker<D> {
    detector: Arc<D>,
    frames: Arc<Mutex<FrameReceiver>>,
    detector_timeout: Duration,
    persistence: PersistenceHandle,
    alerts: mpsc::Sender<Arc<DetectionEvent>>,
    sinks: Vec<Arc<dyn DetectionSink>>,
    state: Arc<PipelineState>,
}

impl<D: Detector> DetectionWorker<D> {
    pub fn new(
        detector: Arc<D>,
        frames: FrameReceiver,
        detector_timeout: Duration,
        persistence: PersistenceHandle,
        alerts: mpsc::Sender<Arc<DetectionEvent>>,
        sinks: Vec<Arc<dyn DetectionSink>>,
        state: Arc<PipelineState>,
    ) -> Self {
        Self {
            detector,
            frames: Arc::new(Mutex::new(frames)),
            detector_timeout,
            persistence,
            alerts,
            sinks,
            state,
        }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut frames = self.frames.lock().await;
        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "waiting for frames"))
            .await;
        ctx.ready();
        tracing::info!(
            timeout_ms = self.detector_timeout.as_millis() as u64,
            sinks = self.sinks.len(),
            "Detection worker started"
        );

        let mut failures = 0u32;
        loop {
            let next = tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                next = frames.recv() => next,
            };

            match next {
                Some(QueueEvent::Frame(frame)) => self.process(&frame, &mut failures).await,
                Some(QueueEvent::Dropped(n)) => {
                    PipelineCounters::add(&self.state.counters.frames_dropped, n);
                    tracing::warn!(dropped = n, "Detection fell behind, oldest frames overwritten");
                }
                None => {
                    tracing::info!("Frame queue closed");
                    return Ok(());
                }
            }
        }

        tracing::info!("Detection worker stopped");
        Ok(())
    }

    /// Detect one frame and fan out the result
    pub async fn process(&self, frame: &Frame, failures: &mut u32) {
        let counters = &self.state.counters;
        let started = Instant::now();

        let result = match tokio::time::timeout(self.detector_timeout, self.detector.detect(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Detection(format!(
                "detector timed out after {:?}",
                self.detector_timeout
            ))),
        };

        let detections = match result {
            Ok(detections) => detections,
            Err(e) => {
                PipelineCounters::incr(&counters.detection_errors);
                *failures += 1;
                tracing::warn!(frame = %frame.identity, error = %e, "Detection failed, skipping frame");
                if *failures == UNHEALTHY_AFTER {
                    self.state
                        .report_health(ComponentHealth::unhealthy(
                            COMPONENT,
                            format!("{} consecutive detector failures: {}", failures, e),
                        ))
                        .await;
                }
                return;
            }
        };

        if *failures >= UNHEALTHY_AFTER {
            self.state
                .report_health(ComponentHealth::healthy(COMPONENT, "detector recovered"))
                .await;
        }
        *failures = 0;

        let event = Arc::new(DetectionEvent::for_frame(frame, detections, started.elapsed()));
        PipelineCounters::incr(&counters.events_processed);
        PipelineCounters::add(&counters.detections_total, event.len() as u64);

        if event.is_empty() {
            tracing::debug!(frame = %frame.identity, processing_ms = event.processing_ms(), "No detections");
        } else {
            tracing::info!(
                frame = %frame.identity,
                count = event.len(),
                classes = ?event.classes(),
                max_confidence = event.max_confidence(),
                processing_ms = event.processing_ms(),
                "Detections found"
            );
        }

        self.persistence.detection(event.clone());

        if !event.is_empty() {
            self.forward_to_alerts(&event);
        }

        self.publish_to_sinks(&event).await;
    }

    fn forward_to_alerts(&self, event: &Arc<DetectionEvent>) {
        match self.alerts.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                PipelineCounters::incr(&self.state.counters.alerts_dropped);
                tracing::warn!(frame = %event.frame_identity(), "Alert queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                PipelineCounters::incr(&self.state.counters.alerts_dropped);
                tracing::warn!(frame = %event.frame_identity(), "Alert engine not receiving, event dropped");
            }
        }
    }

    async fn publish_to_sinks(&self, event: &DetectionEvent) {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let outcome = match tokio::time::timeout(self.detector_timeout, sink.publish(event)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Internal(format!(
                    "delivery timed out after {:?}",
                    self.detector_timeout
                ))),
            };
            (sink.name(), outcome)
        });

        for (name, outcome) in join_all(deliveries).await {
            if let Err(e) = outcome {
                PipelineCounters::incr(&self.state.counters.sink_errors);
                tracing::warn!(sink = name, error = %e, "Detection sink delivery failed");
            }
        }
    }
}
