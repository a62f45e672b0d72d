use super::*;
use crate::error::Error;
use futures::future::BoxFuture;
use crate::health::{HealthLevel, ResourceUsage};
use crate::models::{ComponentHealth, Detection, DetectionEvent, Frame, FrameMeta};
use crate::store::{CleanupReport, PersistenceRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

// ========================================
// Fakes
// ========================================

/// Lists a fixed set of frame identities on every poll
struct ScriptedSource {
    names: StdMutex<Vec<String>>,
}

impl ScriptedSource {
    fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            names: StdMutex::new(names.iter().map(|n| n.to_string()).collect()),
        })
    }

    /// Make a new frame show up on the next poll
    fn add(&self, name: &str) {
        self.names.lock().unwrap().push(name.to_string());
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn poll(&self) -> Result<Vec<FrameMeta>> {
        let names = self.names.lock().unwrap().clone();
        Ok(names
            .into_iter()
            .map(|name| FrameMeta {
                source: "scripted".into(),
                path: PathBuf::from(&name),
                identity: name,
                size_bytes: 3,
                modified_at: chrono::DateTime::UNIX_EPOCH,
            })
            .collect())
    }

    async fn load(&self, meta: &FrameMeta) -> Result<Frame> {
        Ok(Frame::from_meta(meta, vec![1, 2, 3], Utc::now()))
    }
}

/// Returns `per_frame` detections for every frame
struct FixedDetector {
    per_frame: usize,
}

impl Detector for FixedDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok((0..self.per_frame)
            .map(|_| Detection {
                class_name: "mosquito".into(),
                confidence: 0.9,
                bbox: [0.0, 0.0, 8.0, 8.0],
                detected_at: Utc::now(),
            })
            .collect())
    }

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy("detector", "fixed")
    }
}

/// Never answers
struct HangingDetector;

impl Detector for HangingDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy("detector", "hanging")
    }
}

/// Crashes the inference call on every frame
struct PanickingDetector;

impl Detector for PanickingDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        panic!("inference runtime aborted on {}", frame.identity);
    }

    async fn health_check(&self) -> ComponentHealth {
        ComponentHealth::healthy("detector", "panicking")
    }
}

/// Fan-out target that accepts events and never acknowledges them
struct StalledSink;

impl DetectionSink for StalledSink {
    fn name(&self) -> &str {
        "stalled"
    }

    fn publish<'a>(&'a self, _event: &'a DetectionEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(std::future::pending())
    }
}

struct QuietHost;

impl ResourceSampler for QuietHost {
    fn sample(&mut self) -> Result<ResourceUsage> {
        Ok(ResourceUsage {
            cpu_percent: 5.0,
            memory_percent: 10.0,
            disk_percent: 20.0,
            sampled_at: Utc::now(),
        })
    }
}

/// Records persisted detections; fails the first `failures` writes
struct RecordingSink {
    failures: AtomicU32,
    detections: StdMutex<Vec<String>>,
    events: StdMutex<Vec<String>>,
}

impl RecordingSink {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            detections: StdMutex::new(Vec::new()),
            events: StdMutex::new(Vec::new()),
        })
    }

    fn detections(&self) -> Vec<String> {
        self.detections.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl PersistenceSink for RecordingSink {
    async fn write(&self, record: &PersistenceRecord) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Persistence("disk I/O error".into()));
        }
        match record {
            PersistenceRecord::Detection(event) => self
                .detections
                .lock()
                .unwrap()
                .push(event.frame_identity().to_string()),
            PersistenceRecord::SystemEvent(event) => {
                self.events.lock().unwrap().push(event.event_type.clone())
            }
            _ => {}
        }
        Ok(())
    }

    async fn cleanup_older_than(&self, _days: u32) -> Result<CleanupReport> {
        Ok(CleanupReport::default())
    }

    async fn backup_to(&self, dir: &Path) -> Result<PathBuf> {
        Ok(dir.join("noop.db"))
    }
}

// ========================================
// Helpers
// ========================================

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.ingestion.poll_interval = Duration::from_millis(10);
    config.health.sample_interval = Duration::from_millis(50);
    config.alert.prevention.methods = vec!["log".to_string()];
    config.persistence.backup_enabled = false;
    config.supervision.restart_backoff = Duration::from_millis(10);
    config.supervision.ready_timeout = Duration::from_secs(5);
    config
}

fn coordinator<D: Detector>(
    source: Arc<ScriptedSource>,
    detector: D,
    sink: Arc<RecordingSink>,
) -> Coordinator<ScriptedSource, D, RecordingSink> {
    Coordinator::new(source, Arc::new(detector), sink, Arc::new(RealtimeHub::new()))
        .with_resource_sampler(|_| Box::new(QuietHost) as Box<dyn ResourceSampler>)
}

/// Poll `status()` until `done` holds or two seconds pass
async fn wait_for<S, D, P, F>(pipeline: &Coordinator<S, D, P>, done: F) -> PipelineStatus
where
    S: FrameSource,
    D: Detector,
    P: PersistenceSink,
    F: Fn(&PipelineStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = pipeline.status().await;
        if done(&status) || Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ========================================
// Tests
// ========================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_identity_yields_one_event() {
    let sink = RecordingSink::new(0);
    let pipeline = coordinator(
        ScriptedSource::new(&["a.jpg", "b.jpg"]),
        FixedDetector { per_frame: 0 },
        sink.clone(),
    );
    pipeline.start(fast_config()).await.unwrap();

    wait_for(&pipeline, |s| s.counters.events_processed >= 2).await;
    // Several more polls over the same listing
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = pipeline.status().await;
    assert_eq!(status.counters.frames_ingested, 2);
    assert_eq!(status.counters.events_processed, 2);

    let report = pipeline.stop(Duration::from_secs(2)).await.unwrap();
    assert!(report.is_clean());

    let mut persisted = sink.detections();
    persisted.sort();
    assert_eq!(persisted, vec!["a.jpg", "b.jpg"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_detector_never_alerts() {
    let pipeline = coordinator(
        ScriptedSource::new(&["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]),
        FixedDetector { per_frame: 0 },
        RecordingSink::new(0),
    );
    let mut config = fast_config();
    config.alert.threshold = 1;
    pipeline.start(config).await.unwrap();

    let status = wait_for(&pipeline, |s| s.counters.events_processed >= 5).await;
    assert_eq!(status.counters.events_processed, 5);
    assert_eq!(status.counters.alerts_fired, 0);
    assert_eq!(status.alert.pending_count, 0);

    pipeline.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threshold_crossing_fires_once_within_cooldown() {
    let pipeline = coordinator(
        ScriptedSource::new(&["1.jpg", "2.jpg", "3.jpg", "4.jpg"]),
        FixedDetector { per_frame: 1 },
        RecordingSink::new(0),
    );
    pipeline.start(fast_config()).await.unwrap();

    let status = wait_for(&pipeline, |s| s.alert.pending_count == 1 && s.counters.alerts_fired == 1).await;
    assert_eq!(status.counters.alerts_fired, 1);
    assert_eq!(status.alert.pending_count, 1);
    assert!(status.alert.last_alert_at.is_some());

    pipeline.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_returns_with_stuck_detector() {
    let pipeline = coordinator(
        ScriptedSource::new(&["stuck.jpg"]),
        HangingDetector,
        RecordingSink::new(0),
    );
    let mut config = fast_config();
    config.detection.detector_timeout = Duration::from_secs(30);
    pipeline.start(config).await.unwrap();

    wait_for(&pipeline, |s| s.counters.frames_ingested >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let timeout = Duration::from_millis(200);
    let started = std::time::Instant::now();
    let report = pipeline.stop(timeout).await.unwrap();

    assert!(started.elapsed() < timeout + WRITER_GRACE + Duration::from_millis(500));
    assert_eq!(report.timed_out, vec!["detection"]);
    assert!(report.stopped.contains(&"ingestion"));
    assert!(report.stopped.contains(&"persistence"));

    let status = pipeline.status().await;
    assert!(!status.running);
    assert_eq!(status.overall, HealthLevel::Down);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistence_failure_does_not_slow_detection() {
    let sink = RecordingSink::new(1);
    let pipeline = coordinator(
        ScriptedSource::new(&["1.jpg", "2.jpg", "3.jpg"]),
        FixedDetector { per_frame: 0 },
        sink.clone(),
    );
    pipeline.start(fast_config()).await.unwrap();

    let status = wait_for(&pipeline, |s| s.counters.events_processed >= 3).await;
    assert_eq!(status.counters.events_processed, 3);
    assert_eq!(status.counters.detection_errors, 0);

    pipeline.stop(Duration::from_secs(2)).await.unwrap();

    let status = pipeline.status().await;
    assert_eq!(status.counters.persistence_retries, 1);
    assert_eq!(status.counters.persistence_errors, 0);
    assert_eq!(sink.detections().len(), 3);
    assert!(sink.events().contains(&"pipeline_stopped".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_config_is_rejected_before_start() {
    let pipeline = coordinator(
        ScriptedSource::new(&[]),
        FixedDetector { per_frame: 0 },
        RecordingSink::new(0),
    );
    let mut config = fast_config();
    config.alert.threshold = 0;

    let err = pipeline.start(config).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.is_fatal());
    assert!(!pipeline.is_running().await);
    assert!(!pipeline.status().await.running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_conflicts_and_restart_keeps_dedup() {
    let pipeline = coordinator(
        ScriptedSource::new(&["a.jpg"]),
        FixedDetector { per_frame: 0 },
        RecordingSink::new(0),
    );
    pipeline.start(fast_config()).await.unwrap();
    assert!(matches!(
        pipeline.start(fast_config()).await,
        Err(Error::Conflict(_))
    ));

    wait_for(&pipeline, |s| s.counters.events_processed >= 1).await;
    pipeline.stop(Duration::from_secs(2)).await.unwrap();
    assert!(matches!(
        pipeline.stop(Duration::from_secs(1)).await,
        Err(Error::Conflict(_))
    ));

    // Fresh counters, same seen set
    pipeline.start(fast_config()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = pipeline.status().await;
    assert!(status.running);
    assert_eq!(status.counters.frames_ingested, 0);

    pipeline.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_aggregates_components() {
    let pipeline = coordinator(
        ScriptedSource::new(&[]),
        FixedDetector { per_frame: 0 },
        RecordingSink::new(0),
    );
    pipeline.start(fast_config()).await.unwrap();

    let status = wait_for(&pipeline, |s| s.system.usage.is_some() && s.components.len() >= 7).await;
    assert!(status.running);
    assert_eq!(status.overall, HealthLevel::Healthy);

    let names: Vec<&str> = status.components.iter().map(|c| c.name.as_str()).collect();
    for expected in [
        "alert",
        "detection",
        "detector",
        "health",
        "ingestion",
        "maintenance",
        "persistence",
    ] {
        assert!(names.contains(&expected), "missing {}", expected);
    }

    pipeline.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_detection_leaves_other_workers_running() {
    let source = ScriptedSource::new(&["1.jpg", "2.jpg", "3.jpg"]);
    let sink = RecordingSink::new(0);
    let pipeline = coordinator(source.clone(), PanickingDetector, sink.clone());
    let mut config = fast_config();
    config.supervision.max_restarts = 2;
    pipeline.start(config).await.unwrap();

    let failed = |s: &PipelineStatus| {
        s.counters.worker_restarts == 2
            && s.components
                .iter()
                .any(|c| c.name == "detection" && !c.healthy && c.message.contains("permanently failed"))
    };
    let status = wait_for(&pipeline, failed).await;
    assert!(failed(&status));
    assert!(status.running);
    assert_eq!(status.overall, HealthLevel::Down);
    let ingested_before = status.counters.frames_ingested + status.counters.frames_dropped;

    // Ingestion keeps listing and handing off frames nobody consumes
    source.add("4.jpg");
    source.add("5.jpg");
    let status = wait_for(&pipeline, |s| {
        s.counters.frames_ingested + s.counters.frames_dropped >= ingested_before + 2
    })
    .await;
    assert_eq!(
        status.counters.frames_ingested + status.counters.frames_dropped,
        ingested_before + 2
    );
    assert_eq!(status.counters.worker_restarts, 2);

    // Health keeps sampling and persistence keeps writing
    let status = wait_for(&pipeline, |s| s.system.usage.is_some()).await;
    for name in ["ingestion", "health", "persistence"] {
        let component = status.components.iter().find(|c| c.name == name).unwrap();
        assert!(component.healthy, "{} should still be healthy", name);
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    while !sink.events().contains(&"component_failed".to_string()) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = sink.events();
    assert_eq!(events.iter().filter(|e| *e == "worker_restart").count(), 2);
    assert!(events.contains(&"component_failed".to_string()));

    pipeline.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_sink_does_not_stall_pipeline() {
    let sink = RecordingSink::new(0);
    let pipeline = coordinator(
        ScriptedSource::new(&["1.jpg", "2.jpg", "3.jpg"]),
        FixedDetector { per_frame: 1 },
        sink.clone(),
    )
    .with_sink(Arc::new(StalledSink));
    let mut config = fast_config();
    config.detection.detector_timeout = Duration::from_millis(100);
    pipeline.start(config).await.unwrap();

    // each frame costs one delivery timeout, none blocks the next
    let status = wait_for(&pipeline, |s| s.counters.sink_errors >= 3).await;
    assert_eq!(status.counters.events_processed, 3);
    assert_eq!(status.counters.sink_errors, 3);
    assert_eq!(status.counters.detection_errors, 0);

    let report = pipeline.stop(Duration::from_secs(2)).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(sink.detections().len(), 3);
}
