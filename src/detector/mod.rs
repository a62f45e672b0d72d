//! Detector - Object detection capability
//!
//! ## Responsibilities
//!
//! - Define the contract the detection worker consumes
//! - Normalize raw results (confidence floor, per-frame cap)
//!
//! `Ok(vec![])` means "nothing detected"; `Err` means the call failed.
//! The inference algorithm itself lives behind the contract.

mod http;

pub use http::HttpDetector;

use crate::error::Result;
use crate::models::{ComponentHealth, Detection, Frame};
use std::future::Future;

/// Detector tuning knobs
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            max_detections: 10,
        }
    }
}

impl From<&crate::config::DetectionConfig> for DetectorConfig {
    fn from(config: &crate::config::DetectionConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// External detection capability
///
/// Safe to call repeatedly, one frame per call.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &Frame) -> impl Future<Output = Result<Vec<Detection>>> + Send;

    fn health_check(&self) -> impl Future<Output = ComponentHealth> + Send;
}

/// Apply the confidence floor and per-frame cap, keeping detector order
///
/// Detections with a non-finite or out-of-range confidence are discarded.
pub fn postprocess(detections: Vec<Detection>, config: &DetectorConfig) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence.is_finite() && d.confidence <= 1.0)
        .filter(|d| d.confidence >= config.confidence_threshold)
        .take(config.max_detections)
        .collect()
}
