//! Coordinator - Pipeline lifecycle owner
//!
//! ## Responsibilities
//!
//! - Validate configuration and start every worker under supervision
//! - Wire the frame queue, alert channel and persistence hand-off
//! - Wait for each worker's readiness signal before reporting started
//! - Stop everything within a caller-supplied timeout
//! - Serve status from published snapshots only
//!
//! ## Workers
//!
//! ingestion → frame queue → detection → {persistence, alert, sinks}
//! health and maintenance run on their own schedules. The persistence
//! writer has its own cancellation token so it can drain after everything
//! else has stopped.

mod state;
mod status;
mod supervisor;

#[cfg(test)]
mod tests;

pub use state::{CounterSnapshot, PipelineCounters, PipelineState};
pub use status::{overall_level, PipelineStatus, ShutdownReport};
pub use supervisor::{RestartPolicy, Supervisor, WorkerContext};

use crate::alert_engine::{AlertEngine, AlertWorker};
use crate::config::{HealthConfig, PipelineConfig};
use crate::detection_worker::{DetectionSink, DetectionWorker};
use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::frame_queue::{frame_queue, FrameSender};
use crate::frame_source::FrameSource;
use crate::health::{HealthSampler, ResourceSampler, SystemResourceSampler};
use crate::ingestion::{IngestionWorker, SeenFrames};
use crate::models::{Severity, SystemEvent};
use crate::prevention::PreventionDispatcher;
use crate::realtime_hub::RealtimeHub;
use crate::store::maintenance::MaintenanceConfig;
use crate::store::{
    persistence_channel, DetectionStore, MaintenanceWorker, PersistenceHandle, PersistenceSink,
    PersistenceWriter,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra time the persistence writer gets to drain once the deadline is hit
const WRITER_GRACE: Duration = Duration::from_millis(250);

type SamplerFactory = Arc<dyn Fn(&HealthConfig) -> Box<dyn ResourceSampler> + Send + Sync>;

/// What `status()` reads; replaced on start, flagged on stop
#[derive(Clone)]
struct PipelineView {
    state: Arc<PipelineState>,
    frames: Option<FrameSender>,
    running: bool,
}

/// Handles of one running pipeline
struct RunningPipeline {
    state: Arc<PipelineState>,
    persistence: PersistenceHandle,
    shutdown: CancellationToken,
    writer_shutdown: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    writer: JoinHandle<()>,
}

/// Owns and sequences every pipeline worker
pub struct Coordinator<S, D, P = DetectionStore> {
    source: Arc<S>,
    detector: Arc<D>,
    sink: Arc<P>,
    hub: Arc<RealtimeHub>,
    extra_sinks: Vec<Arc<dyn DetectionSink>>,
    sampler_factory: SamplerFactory,
    /// Delivered frame identities, kept across restarts
    seen: Arc<Mutex<SeenFrames>>,
    running: Mutex<Option<RunningPipeline>>,
    view: watch::Sender<PipelineView>,
}

impl<S, D, P> Coordinator<S, D, P>
where
    S: FrameSource,
    D: Detector,
    P: PersistenceSink,
{
    pub fn new(source: Arc<S>, detector: Arc<D>, sink: Arc<P>, hub: Arc<RealtimeHub>) -> Self {
        let defaults = PipelineConfig::default();
        let idle = AlertEngine::new(defaults.alert.threshold, defaults.alert.cooldown);
        let (view, _) = watch::channel(PipelineView {
            state: Arc::new(PipelineState::new(idle.snapshot())),
            frames: None,
            running: false,
        });

        Self {
            source,
            detector,
            sink,
            hub,
            extra_sinks: Vec::new(),
            sampler_factory: Arc::new(|config: &HealthConfig| {
                Box::new(SystemResourceSampler::new(config.disk_path.clone())) as Box<dyn ResourceSampler>
            }),
            seen: Arc::new(Mutex::new(SeenFrames::new(defaults.ingestion.seen_capacity))),
            running: Mutex::new(None),
            view,
        }
    }

    /// Replace the host resource sampler used on each start
    pub fn with_resource_sampler<F>(mut self, factory: F) -> Self
    where
        F: Fn(&HealthConfig) -> Box<dyn ResourceSampler> + Send + Sync + 'static,
    {
        self.sampler_factory = Arc::new(factory);
        self
    }

    /// Add a detection fan-out target next to the realtime hub
    pub fn with_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Validate `config`, launch every worker and wait until all are ready
    pub async fn start(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        let dispatcher = Arc::new(PreventionDispatcher::from_config(&config)?);

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Conflict("pipeline is already running".to_string()));
        }

        self.seen
            .lock()
            .await
            .set_capacity(config.ingestion.seen_capacity);

        let engine = AlertEngine::new(config.alert.threshold, config.alert.cooldown);
        let state = Arc::new(PipelineState::new(engine.snapshot()));
        let (persistence, queue) =
            persistence_channel(config.persistence.write_queue_capacity, state.clone());
        let (frame_tx, frame_rx) = frame_queue(config.ingestion.queue_capacity);
        let (alert_tx, alert_rx) = mpsc::channel(config.alert.queue_capacity);

        let shutdown = CancellationToken::new();
        let writer_shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(
            RestartPolicy::from(&config.supervision),
            state.clone(),
            persistence.clone(),
        );
        let mut readiness: Vec<(&'static str, oneshot::Receiver<()>)> = Vec::new();
        let mut workers = Vec::new();

        // Persistence writer
        let writer = Arc::new(PersistenceWriter::new(self.sink.clone(), queue, state.clone()));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("persistence", ready_rx));
        let writer_task = supervisor.spawn("persistence", writer_shutdown.clone(), ready_tx, move |ctx| {
            let writer = writer.clone();
            async move { writer.run(ctx).await }
        });

        // Ingestion
        let ingestion = Arc::new(IngestionWorker::new(
            self.source.clone(),
            frame_tx.clone(),
            self.seen.clone(),
            config.ingestion.poll_interval,
            state.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("ingestion", ready_rx));
        workers.push((
            "ingestion",
            supervisor.spawn("ingestion", shutdown.clone(), ready_tx, move |ctx| {
                let ingestion = ingestion.clone();
                async move { ingestion.run(ctx).await }
            }),
        ));

        // Detection
        let mut sinks: Vec<Arc<dyn DetectionSink>> = vec![self.hub.clone() as Arc<dyn DetectionSink>];
        sinks.extend(self.extra_sinks.iter().cloned());
        let detection = Arc::new(DetectionWorker::new(
            self.detector.clone(),
            frame_rx,
            config.detection.detector_timeout,
            persistence.clone(),
            alert_tx,
            sinks,
            state.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("detection", ready_rx));
        workers.push((
            "detection",
            supervisor.spawn("detection", shutdown.clone(), ready_tx, move |ctx| {
                let detection = detection.clone();
                async move { detection.run(ctx).await }
            }),
        ));

        // Alert
        let alert = Arc::new(AlertWorker::new(
            alert_rx,
            engine,
            dispatcher,
            self.hub.clone(),
            persistence.clone(),
            state.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("alert", ready_rx));
        workers.push((
            "alert",
            supervisor.spawn("alert", shutdown.clone(), ready_tx, move |ctx| {
                let alert = alert.clone();
                async move { alert.run(ctx).await }
            }),
        ));

        // Health
        let health = Arc::new(HealthSampler::new(
            (self.sampler_factory)(&config.health),
            config.health.thresholds.clone(),
            config.health.sample_interval,
            self.detector.clone(),
            config.detection.detector_timeout,
            persistence.clone(),
            self.hub.clone(),
            state.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("health", ready_rx));
        workers.push((
            "health",
            supervisor.spawn("health", shutdown.clone(), ready_tx, move |ctx| {
                let health = health.clone();
                async move { health.run(ctx).await }
            }),
        ));

        // Maintenance
        let maintenance = Arc::new(MaintenanceWorker::new(
            self.sink.clone(),
            MaintenanceConfig::from(&config.persistence),
            persistence.clone(),
            state.clone(),
        ));
        let (ready_tx, ready_rx) = oneshot::channel();
        readiness.push(("maintenance", ready_rx));
        workers.push((
            "maintenance",
            supervisor.spawn("maintenance", shutdown.clone(), ready_tx, move |ctx| {
                let maintenance = maintenance.clone();
                async move { maintenance.run(ctx).await }
            }),
        ));

        let run = RunningPipeline {
            state: state.clone(),
            persistence: persistence.clone(),
            shutdown,
            writer_shutdown,
            workers,
            writer: writer_task,
        };

        let deadline = Instant::now() + config.supervision.ready_timeout;
        for (name, ready) in readiness {
            if !matches!(tokio::time::timeout_at(deadline, ready).await, Ok(Ok(()))) {
                tracing::error!(component = name, "Worker did not become ready, aborting start");
                Self::shutdown(run, Duration::from_secs(1)).await;
                return Err(Error::Internal(format!("worker {} did not become ready", name)));
            }
        }

        persistence.system_event(SystemEvent::new(
            "pipeline_started",
            format!(
                "threshold={} cooldown={}s source={}",
                config.alert.threshold,
                config.alert.cooldown.as_secs(),
                self.source.name()
            ),
            Severity::Info,
        ));
        tracing::info!(
            threshold = config.alert.threshold,
            cooldown_secs = config.alert.cooldown.as_secs(),
            poll_interval_ms = config.ingestion.poll_interval.as_millis() as u64,
            queue_capacity = config.ingestion.queue_capacity,
            "Pipeline started"
        );

        self.view.send_replace(PipelineView {
            state,
            frames: Some(frame_tx),
            running: true,
        });
        *running = Some(run);
        Ok(())
    }

    /// Cancel every worker and wait up to `timeout` for them to exit
    ///
    /// Workers still running at the deadline are aborted and listed in the
    /// report; the call itself never hangs.
    pub async fn stop(&self, timeout: Duration) -> Result<ShutdownReport> {
        let run = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Conflict("pipeline is not running".to_string()))?;

        let report = Self::shutdown(run, timeout).await;
        self.view.send_modify(|view| view.running = false);
        Ok(report)
    }

    async fn shutdown(run: RunningPipeline, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut report = ShutdownReport::default();

        run.shutdown.cancel();
        for (name, mut handle) in run.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.stopped.push(name),
                Err(_) => {
                    handle.abort();
                    report.timed_out.push(name);
                }
            }
        }

        let counters = run.state.counters.snapshot();
        let severity = if report.is_clean() {
            Severity::Info
        } else {
            Severity::Warning
        };
        run.persistence.system_event(SystemEvent::new(
            "pipeline_stopped",
            format!(
                "frames={} detections={} alerts={} errors={} timed_out={:?}",
                counters.frames_ingested,
                counters.detections_total,
                counters.alerts_fired,
                counters.errors_seen,
                report.timed_out
            ),
            severity,
        ));

        run.writer_shutdown.cancel();
        let mut writer = run.writer;
        let writer_deadline = deadline.max(Instant::now() + WRITER_GRACE);
        match tokio::time::timeout_at(writer_deadline, &mut writer).await {
            Ok(_) => report.stopped.push("persistence"),
            Err(_) => {
                writer.abort();
                report.timed_out.push("persistence");
            }
        }

        report.elapsed = started.elapsed();
        if report.is_clean() {
            tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "Pipeline stopped");
        } else {
            tracing::warn!(
                timed_out = ?report.timed_out,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Degraded shutdown: workers aborted after timeout"
            );
        }
        report
    }

    /// Current status from published snapshots
    pub async fn status(&self) -> PipelineStatus {
        let view = self.view.borrow().clone();
        let components = view.state.components().await;
        let system = view.state.system_snapshot();
        let started_at = view.state.started_at();

        PipelineStatus {
            running: view.running,
            overall: overall_level(view.running, &components, &system),
            components,
            counters: view.state.counters.snapshot(),
            alert: view.state.alert_snapshot(),
            system,
            queue_depth: view.frames.as_ref().map(FrameSender::depth).unwrap_or(0),
            started_at,
            uptime_secs: if view.running {
                (Utc::now() - started_at).num_seconds()
            } else {
                0
            },
        }
    }
}
