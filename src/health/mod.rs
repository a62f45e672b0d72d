//! Health - Resource sampling and evaluation
//!
//! ## Responsibilities
//!
//! - Sample CPU, memory and disk utilization
//! - Classify a sample against warning thresholds
//! - Run the periodic sampler worker (see [`sampler`])
//!
//! Resource pressure can only raise `Warning`. `Down` comes exclusively from
//! a component's own health report.

pub mod sampler;

pub use sampler::HealthSampler;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::{Disks, System};

/// One resource utilization reading (percentages, 0-100)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

/// Warning thresholds (percent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
        }
    }
}

/// Aggregate health level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Down,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Down => "down",
        }
    }
}

/// Result of checking one sample against thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAssessment {
    pub level: HealthLevel,
    pub warnings: Vec<String>,
}

/// Latest published host health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub level: HealthLevel,
    /// `None` until the first successful sample
    pub usage: Option<ResourceUsage>,
    pub warnings: Vec<String>,
    /// Last sampling error, if the most recent read failed
    pub last_error: Option<String>,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            level: HealthLevel::Healthy,
            usage: None,
            warnings: Vec::new(),
            last_error: None,
        }
    }
}

/// Classify a sample; never returns `Down`
pub fn evaluate(usage: &ResourceUsage, thresholds: &HealthThresholds) -> ResourceAssessment {
    let mut warnings = Vec::new();

    if usage.cpu_percent > thresholds.cpu_percent {
        warnings.push(format!("High CPU usage: {:.1}%", usage.cpu_percent));
    }
    if usage.memory_percent > thresholds.memory_percent {
        warnings.push(format!("High memory usage: {:.1}%", usage.memory_percent));
    }
    if usage.disk_percent > thresholds.disk_percent {
        warnings.push(format!("High disk usage: {:.1}%", usage.disk_percent));
    }

    let level = if warnings.is_empty() {
        HealthLevel::Healthy
    } else {
        HealthLevel::Warning
    };

    ResourceAssessment { level, warnings }
}

/// Source of resource readings
pub trait ResourceSampler: Send + 'static {
    fn sample(&mut self) -> Result<ResourceUsage>;
}

/// Host sampler backed by `sysinfo`
pub struct SystemResourceSampler {
    system: System,
    disks: Disks,
    disk_path: PathBuf,
}

impl SystemResourceSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            disk_path: disk_path.into(),
        }
    }

    fn cpu_percent(&self) -> f32 {
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        }
    }

    fn memory_percent(&self) -> Result<f32> {
        let total = self.system.total_memory();
        if total == 0 {
            return Err(Error::Internal("total memory reported as 0".to_string()));
        }
        Ok((self.system.used_memory() as f32 / total as f32) * 100.0)
    }

    /// Usage of the disk whose mount point is the longest prefix of `disk_path`
    fn disk_percent(&self) -> Result<f32> {
        let disk = self
            .disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                Error::Internal(format!("no disk mounted for {}", self.disk_path.display()))
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Err(Error::Internal(format!(
                "disk {} reports zero capacity",
                disk.mount_point().display()
            )));
        }
        let used = total.saturating_sub(disk.available_space());
        Ok((used as f64 / total as f64 * 100.0) as f32)
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&mut self) -> Result<ResourceUsage> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh_list();

        Ok(ResourceUsage {
            cpu_percent: self.cpu_percent(),
            memory_percent: self.memory_percent()?,
            disk_percent: self.disk_percent()?,
            sampled_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f32, memory: f32, disk: f32) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: disk,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_healthy_below_thresholds() {
        let assessment = evaluate(&usage(10.0, 20.0, 30.0), &HealthThresholds::default());
        assert_eq!(assessment.level, HealthLevel::Healthy);
        assert!(assessment.warnings.is_empty());
    }

    #[test]
    fn test_warning_per_resource() {
        let thresholds = HealthThresholds::default();

        let cpu = evaluate(&usage(80.5, 10.0, 10.0), &thresholds);
        assert_eq!(cpu.level, HealthLevel::Warning);
        assert_eq!(cpu.warnings.len(), 1);
        assert!(cpu.warnings[0].contains("CPU"));

        let memory = evaluate(&usage(10.0, 86.0, 10.0), &thresholds);
        assert_eq!(memory.level, HealthLevel::Warning);

        let disk = evaluate(&usage(10.0, 10.0, 95.0), &thresholds);
        assert_eq!(disk.level, HealthLevel::Warning);

        let all = evaluate(&usage(99.0, 99.0, 99.0), &thresholds);
        assert_eq!(all.warnings.len(), 3);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let assessment = evaluate(&usage(80.0, 85.0, 90.0), &HealthThresholds::default());
        assert_eq!(assessment.level, HealthLevel::Healthy);
    }

    #[test]
    fn test_resources_never_report_down() {
        let thresholds = HealthThresholds {
            cpu_percent: 1.0,
            memory_percent: 1.0,
            disk_percent: 1.0,
        };
        let assessment = evaluate(&usage(100.0, 100.0, 100.0), &thresholds);
        assert_eq!(assessment.level, HealthLevel::Warning);
    }

    #[test]
    fn test_level_ordering() {
        assert!(HealthLevel::Down > HealthLevel::Warning);
        assert!(HealthLevel::Warning > HealthLevel::Healthy);
    }
}
