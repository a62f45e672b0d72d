//! Status and shutdown reports

use super::state::CounterSnapshot;
use crate::alert_engine::AlertSnapshot;
use crate::health::{HealthLevel, SystemSnapshot};
use crate::models::ComponentHealth;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Snapshot returned by `Coordinator::status`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub overall: HealthLevel,
    pub components: Vec<ComponentHealth>,
    pub counters: CounterSnapshot,
    pub alert: AlertSnapshot,
    pub system: SystemSnapshot,
    /// Frames waiting for the detection worker
    pub queue_depth: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Combine component reports with the resource assessment
///
/// Any unhealthy component makes the pipeline `Down`; resources alone can
/// only raise `Warning`. A stopped pipeline is `Down`.
pub fn overall_level(running: bool, components: &[ComponentHealth], system: &SystemSnapshot) -> HealthLevel {
    if !running || components.iter().any(|c| !c.healthy) {
        return HealthLevel::Down;
    }
    system.level.min(HealthLevel::Warning)
}

/// Outcome of `Coordinator::stop`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<&'static str>,
    /// Workers that had to be aborted
    pub timed_out: Vec<&'static str>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning() -> SystemSnapshot {
        SystemSnapshot {
            level: HealthLevel::Warning,
            warnings: vec!["High CPU usage: 95.0%".into()],
            ..SystemSnapshot::default()
        }
    }

    #[test]
    fn test_unhealthy_component_means_down() {
        let components = vec![
            ComponentHealth::healthy("ingestion", "polling"),
            ComponentHealth::unhealthy("detection", "permanently failed"),
        ];
        assert_eq!(
            overall_level(true, &components, &SystemSnapshot::default()),
            HealthLevel::Down
        );
    }

    #[test]
    fn test_resources_raise_warning_only() {
        let components = vec![ComponentHealth::healthy("ingestion", "polling")];
        assert_eq!(overall_level(true, &components, &warning()), HealthLevel::Warning);
        assert_eq!(
            overall_level(true, &components, &SystemSnapshot::default()),
            HealthLevel::Healthy
        );
    }

    #[test]
    fn test_stopped_pipeline_is_down() {
        assert_eq!(overall_level(false, &[], &SystemSnapshot::default()), HealthLevel::Down);
    }

    #[test]
    fn test_report_serializes_elapsed_as_millis() {
        let report = ShutdownReport {
            stopped: vec!["ingestion"],
            timed_out: vec!["detection"],
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert!(!report.is_clean());
    }
}
