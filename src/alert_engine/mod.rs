//! AlertEngine - Threshold and cooldown state machine
//!
//! ## Responsibilities
//!
//! - Accumulate detections from non-empty events
//! - Fire an alert once the threshold is reached outside the cooldown
//! - Keep accumulating while suppressed so the next eligible event fires
//!
//! ## States
//!
//! - Idle: nothing pending
//! - Accumulating: pending, below threshold
//! - Suppressed: at or above threshold, cooldown not yet elapsed
//! - Fired: transient; resets to Idle with `last_alert_at = now`
//!
//! The engine is plain data. [`worker::AlertWorker`] owns the only mutable
//! instance and publishes snapshots for everyone else.

pub mod worker;

pub use worker::AlertWorker;

use crate::models::{format_timestamp, DetectionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Alert type recorded for threshold alerts
pub const ALERT_TYPE: &str = "detection_threshold";

/// Externally visible phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    Idle,
    Accumulating,
    Suppressed,
}

/// A fired alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub fired_at: DateTime<Utc>,
    /// Pending count at the moment of firing
    pub detection_count: u64,
    /// Classes accumulated since the previous alert
    pub classes: BTreeSet<String>,
    pub max_confidence: f32,
    /// Frame whose event triggered the alert
    pub frame_identity: String,
    pub image_path: Option<String>,
    pub message: String,
    pub severity: String,
}

/// Outcome of observing one event
#[derive(Debug, Clone, PartialEq)]
pub enum AlertDecision {
    Fired(Alert),
    Suppressed { pending_count: u64 },
    Accumulating { pending_count: u64 },
    /// Empty events do not count
    Ignored,
}

/// Read-only view of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSnapshot {
    pub phase: AlertPhase,
    pub pending_count: u64,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_secs: f64,
    pub alerts_fired: u64,
    pub suppressed_events: u64,
}

/// Threshold + cooldown suppression state
#[derive(Debug, Clone)]
pub struct AlertEngine {
    pending_count: u64,
    last_alert_at: Option<DateTime<Utc>>,
    threshold: u32,
    cooldown: Duration,
    pending_classes: BTreeSet<String>,
    pending_max_confidence: f32,
    alerts_fired: u64,
    suppressed_events: u64,
}

impl AlertEngine {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            pending_count: 0,
            last_alert_at: None,
            threshold: threshold.max(1),
            cooldown,
            pending_classes: BTreeSet::new(),
            pending_max_confidence: 0.0,
            alerts_fired: 0,
            suppressed_events: 0,
        }
    }

    pub fn pending_count(&self) -> u64 {
        self.pending_count
    }

    pub fn last_alert_at(&self) -> Option<DateTime<Utc>> {
        self.last_alert_at
    }

    pub fn phase(&self) -> AlertPhase {
        if self.pending_count == 0 {
            AlertPhase::Idle
        } else if self.pending_count >= u64::from(self.threshold) {
            AlertPhase::Suppressed
        } else {
            AlertPhase::Accumulating
        }
    }

    /// Whether the cooldown has elapsed at `now`
    ///
    /// A clock that moved backwards keeps the cooldown in force.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_alert_at {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.cooldown,
                Err(_) => false,
            },
        }
    }

    /// Apply one event at `now`
    pub fn observe(&mut self, event: &DetectionEvent, now: DateTime<Utc>) -> AlertDecision {
        if event.is_empty() {
            return AlertDecision::Ignored;
        }

        self.pending_count += event.len() as u64;
        self.pending_classes.extend(event.classes().iter().cloned());
        self.pending_max_confidence = self.pending_max_confidence.max(event.max_confidence());

        if self.pending_count < u64::from(self.threshold) {
            return AlertDecision::Accumulating {
                pending_count: self.pending_count,
            };
        }

        if !self.cooldown_elapsed(now) {
            self.suppressed_events += 1;
            return AlertDecision::Suppressed {
                pending_count: self.pending_count,
            };
        }

        let classes = std::mem::take(&mut self.pending_classes);
        let detection_count = self.pending_count;
        let max_confidence = self.pending_max_confidence;

        self.pending_count = 0;
        self.pending_max_confidence = 0.0;
        self.last_alert_at = Some(now);
        self.alerts_fired += 1;

        let class_list = classes.iter().cloned().collect::<Vec<_>>().join(", ");
        let message = format!(
            "{} detections reached threshold {} at {} (classes: {}, max confidence {:.2})",
            detection_count,
            self.threshold,
            format_timestamp(now),
            class_list,
            max_confidence
        );

        AlertDecision::Fired(Alert {
            alert_type: ALERT_TYPE.to_string(),
            fired_at: now,
            detection_count,
            classes,
            max_confidence,
            frame_identity: event.frame_identity().to_string(),
            image_path: event.image_path().map(String::from),
            message,
            severity: "warning".to_string(),
        })
    }

    pub fn snapshot(&self) -> AlertSnapshot {
        AlertSnapshot {
            phase: self.phase(),
            pending_count: self.pending_count,
            last_alert_at: self.last_alert_at,
            threshold: self.threshold,
            cooldown_secs: self.cooldown.as_secs_f64(),
            alerts_fired: self.alerts_fired,
            suppressed_events: self.suppressed_events,
        }
    }
}
