//! Shared models and types for Iron Dome
//!
//! Frames, detections and detection events flow from ingestion through
//! detection to every fan-out target. Events are built once and shared
//! behind `Arc`, so consumers only ever see read-only views.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Format a timestamp the way it is persisted (fixed-width RFC 3339, micros, `Z`)
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Metadata for a frame the source has available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub source: String,
    /// Stable per-source identity (file name)
    pub identity: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// One captured image plus source metadata
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: String,
    pub identity: String,
    pub path: PathBuf,
    pub image: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl Frame {
    /// Build a frame from loaded bytes
    pub fn from_meta(meta: &FrameMeta, image: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self {
            source: meta.source.clone(),
            identity: meta.identity.clone(),
            path: meta.path.clone(),
            size_bytes: image.len() as u64,
            image: Arc::from(image),
            captured_at,
        }
    }
}

/// One classified object instance within a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// [x1, y1, x2, y2]
    pub bbox: [f32; 4],
    pub detected_at: DateTime<Utc>,
}

/// Aggregated result of running the detector on one frame
///
/// Fields are private; the event is immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    frame_identity: String,
    image_path: Option<String>,
    detections: Vec<Detection>,
    classes: BTreeSet<String>,
    max_confidence: f32,
    occurred_at: DateTime<Utc>,
    processing_ms: f64,
}

impl DetectionEvent {
    pub fn new(
        frame_identity: impl Into<String>,
        image_path: Option<String>,
        detections: Vec<Detection>,
        occurred_at: DateTime<Utc>,
        processing_time: Duration,
    ) -> Self {
        let classes = detections.iter().map(|d| d.class_name.clone()).collect();
        let max_confidence = detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0_f32, f32::max);

        Self {
            frame_identity: frame_identity.into(),
            image_path,
            detections,
            classes,
            max_confidence,
            occurred_at,
            processing_ms: processing_time.as_secs_f64() * 1000.0,
        }
    }

    /// Build an event for a processed frame
    pub fn for_frame(frame: &Frame, detections: Vec<Detection>, processing_time: Duration) -> Self {
        Self::new(
            frame.identity.clone(),
            Some(frame.path.display().to_string()),
            detections,
            Utc::now(),
            processing_time,
        )
    }

    pub fn frame_identity(&self) -> &str {
        &self.frame_identity
    }

    pub fn image_path(&self) -> Option<&str> {
        self.image_path.as_deref()
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn classes(&self) -> &BTreeSet<String> {
        &self.classes
    }

    pub fn max_confidence(&self) -> f32 {
        self.max_confidence
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn processing_ms(&self) -> f64 {
        self.processing_ms
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    /// "No detection" telemetry event
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Self-reported health of one pipeline component
///
/// Replaced wholesale on every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            message: message.into(),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            message: message.into(),
            checked_at: Utc::now(),
        }
    }
}

/// Severity for system events and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// A pipeline lifecycle or operational event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
    pub severity: Severity,
}

impl SystemEvent {
    pub fn new(event_type: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
