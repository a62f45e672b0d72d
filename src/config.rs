//! PipelineConfig - Runtime configuration
//!
//! ## Responsibilities
//!
//! - Defaults for every pipeline section
//! - Environment overrides (`IRON_DOME_*`)
//! - Fail-fast validation before the coordinator starts any worker

use crate::error::{Error, Result};
use crate::health::HealthThresholds;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest retention the store accepts (100 years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Prevention method names understood by the dispatcher
pub const KNOWN_PREVENTION_METHODS: &[&str] = &["alert", "log", "notification", "email", "webhook"];

/// Ingestion worker settings
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Folder the directory frame source watches
    pub capture_dir: PathBuf,
    pub source_name: String,
    pub poll_interval: Duration,
    /// Frame queue capacity (rounded up to a power of two)
    pub queue_capacity: usize,
    /// Seen-identity set size before eviction kicks in
    pub seen_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            capture_dir: PathBuf::from("data/captures"),
            source_name: "phone_camera".to_string(),
            poll_interval: Duration::from_millis(100),
            queue_capacity: 32,
            seen_capacity: 100_000,
        }
    }
}

/// Detector settings
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Per-call timeout for the detector
    pub detector_timeout: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            max_detections: 10,
            detector_timeout: Duration::from_secs(10),
        }
    }
}

/// Prevention actions run when an alert fires
#[derive(Debug, Clone)]
pub struct PreventionConfig {
    pub enabled: bool,
    pub methods: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    /// Recipient recorded on email notifications
    pub email_to: Option<String>,
}

impl Default for PreventionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![
                "alert".to_string(),
                "log".to_string(),
                "notification".to_string(),
            ],
            webhook_url: None,
            webhook_timeout: Duration::from_secs(5),
            email_to: None,
        }
    }
}

/// Alert engine settings
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub threshold: u32,
    pub cooldown: Duration,
    /// Detection events buffered for the alert engine
    pub queue_capacity: usize,
    pub prevention: PreventionConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(300),
            queue_capacity: 256,
            prevention: PreventionConfig::default(),
        }
    }
}

/// Health sampler settings
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub sample_interval: Duration,
    pub thresholds: HealthThresholds,
    /// Path whose filesystem is reported as disk usage
    pub disk_path: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            thresholds: HealthThresholds::default(),
            disk_path: PathBuf::from("/"),
        }
    }
}

/// Persistence sink settings
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub database_path: PathBuf,
    pub backup_enabled: bool,
    pub backup_dir: PathBuf,
    pub backup_interval: Duration,
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    /// Capacity of the write hand-off queue
    pub write_queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/iron_dome.db"),
            backup_enabled: true,
            backup_dir: PathBuf::from("data/backups"),
            backup_interval: Duration::from_secs(86_400),
            retention_days: 30,
            cleanup_interval: Duration::from_secs(86_400),
            write_queue_capacity: 1024,
        }
    }
}

/// Worker restart policy
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_backoff: Duration,
    /// How long `start` waits for every worker to report ready
    pub ready_timeout: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            restart_backoff: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub ingestion: IngestionConfig,
    pub detection: DetectionConfig,
    pub alert: AlertConfig,
    pub health: HealthConfig,
    pub persistence: PersistenceConfig,
    pub supervision: SupervisionConfig,
}

impl PipelineConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        let ingestion = &mut config.ingestion;
        if let Some(dir) = env.string("IRON_DOME_CAPTURE_DIR") {
            ingestion.capture_dir = PathBuf::from(dir);
        }
        if let Some(name) = env.string("IRON_DOME_SOURCE_NAME") {
            ingestion.source_name = name;
        }
        if let Some(ms) = env.parse::<u64>("IRON_DOME_POLL_INTERVAL_MS")? {
            ingestion.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse("IRON_DOME_QUEUE_CAPACITY")? {
            ingestion.queue_capacity = n;
        }
        if let Some(n) = env.parse("IRON_DOME_SEEN_CAPACITY")? {
            ingestion.seen_capacity = n;
        }

        let detection = &mut config.detection;
        if let Some(v) = env.parse("IRON_DOME_CONFIDENCE_THRESHOLD")? {
            detection.confidence_threshold = v;
        }
        if let Some(v) = env.parse("IRON_DOME_IOU_THRESHOLD")? {
            detection.iou_threshold = v;
        }
        if let Some(v) = env.parse("IRON_DOME_MAX_DETECTIONS")? {
            detection.max_detections = v;
        }
        if let Some(ms) = env.parse::<u64>("IRON_DOME_DETECTOR_TIMEOUT_MS")? {
            detection.detector_timeout = Duration::from_millis(ms);
        }

        let alert = &mut config.alert;
        if let Some(v) = env.parse("IRON_DOME_ALERT_THRESHOLD")? {
            alert.threshold = v;
        }
        if let Some(secs) = env.parse::<u64>("IRON_DOME_ALERT_COOLDOWN_SECS")? {
            alert.cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("IRON_DOME_ALERT_QUEUE_CAPACITY")? {
            alert.queue_capacity = n;
        }
        if let Some(v) = env.parse("IRON_DOME_PREVENTION_ENABLED")? {
            alert.prevention.enabled = v;
        }
        if let Some(methods) = env.string("IRON_DOME_PREVENTION_METHODS") {
            alert.prevention.methods = methods
                .split(',')
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect();
        }
        if let Some(url) = env.string("IRON_DOME_WEBHOOK_URL") {
            alert.prevention.webhook_url = Some(url);
        }
        if let Some(to) = env.string("IRON_DOME_EMAIL_TO") {
            alert.prevention.email_to = Some(to);
        }

        let health = &mut config.health;
        if let Some(secs) = env.parse::<u64>("IRON_DOME_HEALTH_INTERVAL_SECS")? {
            health.sample_interval = Duration::from_secs(secs);
        }
        if let Some(v) = env.parse("IRON_DOME_CPU_WARNING_PERCENT")? {
            health.thresholds.cpu_percent = v;
        }
        if let Some(v) = env.parse("IRON_DOME_MEMORY_WARNING_PERCENT")? {
            health.thresholds.memory_percent = v;
        }
        if let Some(v) = env.parse("IRON_DOME_DISK_WARNING_PERCENT")? {
            health.thresholds.disk_percent = v;
        }
        if let Some(path) = env.string("IRON_DOME_DISK_PATH") {
            health.disk_path = PathBuf::from(path);
        }

        let persistence = &mut config.persistence;
        if let Some(path) = env.string("IRON_DOME_DATABASE_PATH") {
            persistence.database_path = PathBuf::from(path);
        }
        if let Some(v) = env.parse("IRON_DOME_BACKUP_ENABLED")? {
            persistence.backup_enabled = v;
        }
        if let Some(dir) = env.string("IRON_DOME_BACKUP_DIR") {
            persistence.backup_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env.parse::<u64>("IRON_DOME_BACKUP_INTERVAL_SECS")? {
            persistence.backup_interval = Duration::from_secs(secs);
        }
        if let Some(days) = env.parse("IRON_DOME_RETENTION_DAYS")? {
            persistence.retention_days = days;
        }
        if let Some(secs) = env.parse::<u64>("IRON_DOME_CLEANUP_INTERVAL_SECS")? {
            persistence.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("IRON_DOME_WRITE_QUEUE_CAPACITY")? {
            persistence.write_queue_capacity = n;
        }

        let supervision = &mut config.supervision;
        if let Some(n) = env.parse("IRON_DOME_MAX_RESTARTS")? {
            supervision.max_restarts = n;
        }
        if let Some(secs) = env.parse::<u64>("IRON_DOME_RESTART_WINDOW_SECS")? {
            supervision.restart_window = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("IRON_DOME_RESTART_BACKOFF_MS")? {
            supervision.restart_backoff = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Validate every section; the first violation is returned as `Error::Config`
    pub fn validate(&self) -> Result<()> {
        let ingestion = &self.ingestion;
        ensure_path(&ingestion.capture_dir, "ingestion.capture_dir")?;
        ensure_nonzero(ingestion.poll_interval, "ingestion.poll_interval")?;
        ensure(ingestion.queue_capacity > 0, "ingestion.queue_capacity must be > 0")?;
        ensure(ingestion.seen_capacity > 0, "ingestion.seen_capacity must be > 0")?;
        ensure(
            !ingestion.source_name.trim().is_empty(),
            "ingestion.source_name must not be empty",
        )?;

        let detection = &self.detection;
        ensure_unit(detection.confidence_threshold, "detection.confidence_threshold")?;
        ensure_unit(detection.iou_threshold, "detection.iou_threshold")?;
        ensure(detection.max_detections >= 1, "detection.max_detections must be >= 1")?;
        ensure_nonzero(detection.detector_timeout, "detection.detector_timeout")?;

        let alert = &self.alert;
        ensure(alert.threshold >= 1, "alert.threshold must be >= 1")?;
        ensure(alert.queue_capacity > 0, "alert.queue_capacity must be > 0")?;
        let prevention = &alert.prevention;
        if prevention.enabled && prevention.methods.iter().any(|m| m == "webhook") {
            match prevention.webhook_url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(Error::Config(format!(
                        "alert.prevention.webhook_url is not an http(s) URL: {}",
                        url
                    )))
                }
                None => {
                    return Err(Error::Config(
                        "webhook prevention method requires alert.prevention.webhook_url"
                            .to_string(),
                    ))
                }
            }
            ensure_nonzero(prevention.webhook_timeout, "alert.prevention.webhook_timeout")?;
        }

        let health = &self.health;
        ensure_nonzero(health.sample_interval, "health.sample_interval")?;
        ensure_percent(health.thresholds.cpu_percent, "health.thresholds.cpu_percent")?;
        ensure_percent(health.thresholds.memory_percent, "health.thresholds.memory_percent")?;
        ensure_percent(health.thresholds.disk_percent, "health.thresholds.disk_percent")?;
        ensure_path(&health.disk_path, "health.disk_path")?;

        let persistence = &self.persistence;
        ensure_path(&persistence.database_path, "persistence.database_path")?;
        ensure(
            (1..=MAX_RETENTION_DAYS).contains(&persistence.retention_days),
            &format!(
                "persistence.retention_days must be within [1, {}], got {}",
                MAX_RETENTION_DAYS, persistence.retention_days
            ),
        )?;
        ensure_nonzero(persistence.cleanup_interval, "persistence.cleanup_interval")?;
        ensure(
            persistence.write_queue_capacity > 0,
            "persistence.write_queue_capacity must be > 0",
        )?;
        if persistence.backup_enabled {
            ensure_path(&persistence.backup_dir, "persistence.backup_dir")?;
            ensure_nonzero(persistence.backup_interval, "persistence.backup_interval")?;
        }

        let supervision = &self.supervision;
        ensure(supervision.max_restarts >= 1, "supervision.max_restarts must be >= 1")?;
        ensure_nonzero(supervision.restart_window, "supervision.restart_window")?;
        ensure_nonzero(supervision.ready_timeout, "supervision.ready_timeout")?;

        Ok(())
    }

    /// Prevention methods that will actually run; unknown names are skipped
    pub fn active_prevention_methods(&self) -> Vec<String> {
        let prevention = &self.alert.prevention;
        if !prevention.enabled {
            return Vec::new();
        }
        prevention
            .methods
            .iter()
            .filter(|m| {
                let known = KNOWN_PREVENTION_METHODS.contains(&m.as_str());
                if !known {
                    tracing::warn!(method = %m, "Unknown prevention method, ignoring");
                }
                known
            })
            .cloned()
            .collect()
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<'a, F> EnvReader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        }
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message.to_string()))
    }
}

fn ensure_nonzero(value: Duration, field: &str) -> Result<()> {
    ensure(!value.is_zero(), &format!("{} must be > 0", field))
}

fn ensure_unit(value: f32, field: &str) -> Result<()> {
    ensure(
        (0.0..=1.0).contains(&value),
        &format!("{} must be within [0, 1], got {}", field, value),
    )
}

fn ensure_percent(value: f32, field: &str) -> Result<()> {
    ensure(
        value > 0.0 && value <= 100.0,
        &format!("{} must be within (0, 100], got {}", field, value),
    )
}

fn ensure_path(path: &std::path::Path, field: &str) -> Result<()> {
    ensure(
        !path.as_os_str().is_empty(),
        &format!("{} must not be empty", field),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alert.threshold, 3);
        assert_eq!(config.alert.cooldown, Duration::from_secs(300));
        assert_eq!(config.detection.max_detections, 10);
        assert_eq!(config.health.sample_interval, Duration::from_secs(30));
        assert_eq!(config.persistence.retention_days, 30);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("IRON_DOME_ALERT_THRESHOLD", "5"),
            ("IRON_DOME_ALERT_COOLDOWN_SECS", "10"),
            ("IRON_DOME_PREVENTION_METHODS", "log, Webhook"),
            ("IRON_DOME_WEBHOOK_URL", "http://localhost:9000/hook"),
            ("IRON_DOME_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.alert.threshold, 5);
        assert_eq!(config.alert.cooldown, Duration::from_secs(10));
        assert_eq!(config.alert.prevention.methods, vec!["log", "webhook"]);
        assert_eq!(config.ingestion.poll_interval, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_value_is_config_error() {
        let err = PipelineConfig::from_lookup(lookup(&[("IRON_DOME_ALERT_THRESHOLD", "three")]))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("IRON_DOME_ALERT_THRESHOLD"));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = PipelineConfig::default();
        config.alert.threshold = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = PipelineConfig::default();
        config.ingestion.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.health.sample_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_detector_thresholds() {
        let mut config = PipelineConfig::default();
        config.detection.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.detection.iou_threshold = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let mut config = PipelineConfig::default();
        config.ingestion.capture_dir = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.persistence.backup_dir = PathBuf::new();
        assert!(config.validate().is_err());
        config.persistence.backup_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webhook_requires_url() {
        let mut config = PipelineConfig::default();
        config.alert.prevention.methods.push("webhook".to_string());
        assert!(config.validate().is_err());

        config.alert.prevention.webhook_url = Some("ftp://nope".to_string());
        assert!(config.validate().is_err());

        config.alert.prevention.webhook_url = Some("https://example.com/hook".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_active_methods_skip_unknown() {
        let mut config = PipelineConfig::default();
        config.alert.prevention.methods = vec!["log".into(), "sms".into(), "email".into()];
        assert_eq!(config.active_prevention_methods(), vec!["log", "email"]);

        config.alert.prevention.enabled = false;
        assert!(config.active_prevention_methods().is_empty());
    }

    #[test]
    fn test_validate_caps_retention() {
        let config = PipelineConfig::from_lookup(lookup(&[("IRON_DOME_RETENTION_DAYS", "1000000000")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("retention_days"));

        let mut config = PipelineConfig::default();
        config.persistence.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());
    }
}
