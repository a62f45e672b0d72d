//! Application state
//!
//! Holds the shared components the HTTP surface reads from

use crate::coordinator::Coordinator;
use crate::detector::HttpDetector;
use crate::frame_source::DirectoryFrameSource;
use crate::realtime_hub::RealtimeHub;
use crate::store::DetectionStore;
use std::sync::Arc;
use std::time::Duration;

/// The concrete pipeline the binary runs
pub type AppPipeline = Coordinator<DirectoryFrameSource, HttpDetector, DetectionStore>;

/// Server configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Inference service base URL
    pub detector_url: String,
    /// Upper bound for `Coordinator::stop` on Ctrl-C
    pub shutdown_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            detector_url: std::env::var("IRON_DOME_DETECTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            shutdown_timeout: std::env::var("IRON_DOME_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// Read side of the persistence sink
    pub store: DetectionStore,
    pub pipeline: Arc<AppPipeline>,
    /// RealtimeHub (WebSocket distribution)
    pub realtime: Arc<RealtimeHub>,
}
