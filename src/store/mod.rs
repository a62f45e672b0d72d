//! DetectionStore - Persistence sink
//!
//! ## Responsibilities
//!
//! - Append detection events, system events, metrics and alerts (SQLite)
//! - Bounded-window queries and analytics for the status surface
//! - Age-based retention cleanup
//! - Online backup via `VACUUM INTO` while writers continue (WAL mode)
//!
//! Rows are never updated in place. Timestamps are stored as fixed-width
//! RFC 3339 text so lexical order equals time order.

pub mod maintenance;
pub mod writer;

pub use maintenance::MaintenanceWorker;
pub use writer::{persistence_channel, PersistenceHandle, PersistenceQueue, PersistenceWriter};

use crate::alert_engine::Alert;
use crate::error::{Error, Result};
use crate::models::{format_timestamp, DetectionEvent, SystemEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS detections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        frame_identity TEXT,
        classes TEXT NOT NULL,
        confidence REAL NOT NULL,
        detection_count INTEGER NOT NULL DEFAULT 0,
        image_path TEXT,
        processing_time REAL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        message TEXT NOT NULL,
        severity TEXT NOT NULL DEFAULT 'info',
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS performance_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        cpu_usage REAL,
        memory_usage REAL,
        disk_usage REAL,
        detection_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        alert_type TEXT NOT NULL,
        message TEXT NOT NULL,
        detection_count INTEGER NOT NULL DEFAULT 0,
        severity TEXT NOT NULL DEFAULT 'warning',
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_system_events_timestamp ON system_events(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_performance_metrics_timestamp ON performance_metrics(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp)",
];

/// Tables subject to retention
const TABLES: [&str; 4] = ["detections", "system_events", "performance_metrics", "alerts"];

/// One health sample as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    /// Detections processed so far
    pub detection_count: u64,
    /// Errors seen so far
    pub error_count: u64,
}

/// Anything the persistence writer can append
#[derive(Debug, Clone)]
pub enum PersistenceRecord {
    Detection(Arc<DetectionEvent>),
    SystemEvent(SystemEvent),
    Metrics(MetricsSample),
    Alert(Alert),
}

impl PersistenceRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceRecord::Detection(_) => "detection",
            PersistenceRecord::SystemEvent(_) => "system_event",
            PersistenceRecord::Metrics(_) => "metrics",
            PersistenceRecord::Alert(_) => "alert",
        }
    }
}

/// Persisted detection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub frame_identity: Option<String>,
    pub classes: Vec<String>,
    pub confidence: f64,
    pub detection_count: i64,
    pub image_path: Option<String>,
    /// Seconds
    pub processing_time: Option<f64>,
}

/// Persisted system event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
    pub severity: String,
}

/// Persisted metrics row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub detection_count: i64,
    pub error_count: i64,
}

/// Persisted alert row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
    pub message: String,
    pub detection_count: i64,
    pub severity: String,
}

/// Detection analytics over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub window_days: u32,
    /// Events with at least one detection
    pub total_detections: i64,
    /// Same, last 24 hours
    pub recent_detections: i64,
    pub unique_classes: Vec<String>,
    pub average_confidence: f64,
    pub detection_rate_per_hour: f64,
}

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub detections: i64,
    pub system_events: i64,
    pub performance_metrics: i64,
    pub alerts: i64,
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub detections: u64,
    pub system_events: u64,
    pub performance_metrics: u64,
    pub alerts: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.detections + self.system_events + self.performance_metrics + self.alerts
    }

    fn set(&mut self, table: &str, deleted: u64) {
        match table {
            "detections" => self.detections = deleted,
            "system_events" => self.system_events = deleted,
            "performance_metrics" => self.performance_metrics = deleted,
            "alerts" => self.alerts = deleted,
            _ => {}
        }
    }
}

/// Write side of the persistence sink, as seen by the writer worker
pub trait PersistenceSink: Send + Sync + 'static {
    fn write(&self, record: &PersistenceRecord) -> impl Future<Output = Result<()>> + Send;

    fn cleanup_older_than(&self, days: u32) -> impl Future<Output = Result<CleanupReport>> + Send;

    fn backup_to(&self, dir: &Path) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct DetectionStore {
    pool: SqlitePool,
}

impl DetectionStore {
    /// Open (or create) the database file in WAL mode and apply the schema
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::info!(path = %path.display(), "Database connected");
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Cheap connectivity check
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // ========================================
    // Writes
    // ========================================

    pub async fn insert_detection(&self, event: &DetectionEvent) -> Result<i64> {
        let classes: Vec<&String> = event.classes().iter().collect();
        let classes_json = serde_json::to_string(&classes)?;

        let result = sqlx::query(
            r#"
            INSERT INTO detections
                (timestamp, frame_identity, classes, confidence, detection_count, image_path, processing_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(event.occurred_at()))
        .bind(event.frame_identity())
        .bind(classes_json)
        .bind(f64::from(event.max_confidence()))
        .bind(event.len() as i64)
        .bind(event.image_path())
        .bind(event.processing_ms() / 1000.0)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_system_event(&self, event: &SystemEvent) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO system_events (timestamp, event_type, message, severity) VALUES (?, ?, ?, ?)",
        )
        .bind(format_timestamp(event.timestamp))
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(event.severity.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_metrics(&self, sample: &MetricsSample) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO performance_metrics
                (timestamp, cpu_usage, memory_usage, disk_usage, detection_count, error_count)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(sample.timestamp))
        .bind(f64::from(sample.cpu_percent))
        .bind(f64::from(sample.memory_percent))
        .bind(f64::from(sample.disk_percent))
        .bind(sample.detection_count as i64)
        .bind(sample.error_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_alert(&self, alert: &Alert) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO alerts (timestamp, alert_type, message, detection_count, severity) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format_timestamp(alert.fired_at))
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(alert.detection_count as i64)
        .bind(&alert.severity)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    // ========================================
    // Window queries (newest first)
    // ========================================

    pub async fn detections(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<DetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, frame_identity, classes, confidence, detection_count,
                   image_path, processing_time
            FROM detections
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_detection).collect()
    }

    pub async fn system_events(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SystemEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, event_type, message, severity
            FROM system_events
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SystemEventRecord {
                    id: row.try_get("id")?,
                    timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                    event_type: row.try_get("event_type")?,
                    message: row.try_get("message")?,
                    severity: row.try_get("severity")?,
                })
            })
            .collect()
    }

    pub async fn metrics(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<MetricRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, cpu_usage, memory_usage, disk_usage, detection_count, error_count
            FROM performance_metrics
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MetricRecord {
                    id: row.try_get("id")?,
                    timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                    cpu_usage: row.try_get("cpu_usage")?,
                    memory_usage: row.try_get("memory_usage")?,
                    disk_usage: row.try_get("disk_usage")?,
                    detection_count: row.try_get("detection_count")?,
                    error_count: row.try_get("error_count")?,
                })
            })
            .collect()
    }

    pub async fn alerts(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, alert_type, message, detection_count, severity
            FROM alerts
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(since))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AlertRecord {
                    id: row.try_get("id")?,
                    timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                    alert_type: row.try_get("alert_type")?,
                    message: row.try_get("message")?,
                    detection_count: row.try_get("detection_count")?,
                    severity: row.try_get("severity")?,
                })
            })
            .collect()
    }

    // ========================================
    // Analytics
    // ========================================

    /// Summary over the last `days` days
    pub async fn analytics(&self, days: u32) -> Result<AnalyticsSummary> {
        let days = days.max(1);
        let now = Utc::now();
        let since = days_before(now, days)?;
        let recent_since = format_timestamp(now - chrono::Duration::hours(24));

        let rows = sqlx::query(
            r#"
            SELECT timestamp, classes, confidence
            FROM detections
            WHERE timestamp >= ? AND detection_count > 0
            "#,
        )
        .bind(format_timestamp(since))
        .fetch_all(&self.pool)
        .await?;

        let mut classes = BTreeSet::new();
        let mut confidence_sum = 0.0;
        let mut recent = 0i64;

        for row in &rows {
            let timestamp: String = row.try_get("timestamp")?;
            if timestamp >= recent_since {
                recent += 1;
            }
            let classes_json: String = row.try_get("classes")?;
            let row_classes: Vec<String> = serde_json::from_str(&classes_json)?;
            classes.extend(row_classes);
            confidence_sum += row.try_get::<f64, _>("confidence")?;
        }

        let total = rows.len() as i64;
        let average_confidence = if total > 0 {
            confidence_sum / total as f64
        } else {
            0.0
        };

        Ok(AnalyticsSummary {
            window_days: days,
            total_detections: total,
            recent_detections: recent,
            unique_classes: classes.into_iter().collect(),
            average_confidence,
            detection_rate_per_hour: total as f64 / (f64::from(days) * 24.0),
        })
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        let mut counts = TableCounts::default();
        for table in TABLES {
            let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table))
                .fetch_one(&self.pool)
                .await?
                .try_get("n")?;
            match table {
                "detections" => counts.detections = count,
                "system_events" => counts.system_events = count,
                "performance_metrics" => counts.performance_metrics = count,
                _ => counts.alerts = count,
            }
        }
        Ok(counts)
    }

    // ========================================
    // Maintenance
    // ========================================

    /// Delete rows older than `days` days from every table
    ///
    /// Runs in one transaction; repeating it deletes nothing new.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<CleanupReport> {
        let cutoff = format_timestamp(days_before(Utc::now(), days)?);
        let mut report = CleanupReport::default();

        let mut tx = self.pool.begin().await?;
        for table in TABLES {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE timestamp < ?", table))
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?;
            report.set(table, result.rows_affected());
        }
        tx.commit().await?;

        Ok(report)
    }

    /// Hot backup into `dir`; returns the backup file path
    pub async fn backup_to(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let name = format!(
            "iron_dome_backup_{}.db",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(name);
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::Persistence(format!(
                "backup {} already exists",
                path.display()
            )));
        }

        let target = path
            .to_str()
            .ok_or_else(|| Error::Persistence(format!("non-UTF-8 backup path {}", path.display())))?
            .to_string();

        sqlx::query("VACUUM INTO ?")
            .bind(target)
            .execute(&self.pool)
            .await?;

        Ok(path)
    }
}

impl PersistenceSink for DetectionStore {
    async fn write(&self, record: &PersistenceRecord) -> Result<()> {
        match record {
            PersistenceRecord::Detection(event) => self.insert_detection(event).await?,
            PersistenceRecord::SystemEvent(event) => self.insert_system_event(event).await?,
            PersistenceRecord::Metrics(sample) => self.insert_metrics(sample).await?,
            PersistenceRecord::Alert(alert) => self.insert_alert(alert).await?,
        };
        Ok(())
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<CleanupReport> {
        DetectionStore::cleanup_older_than(self, days).await
    }

    async fn backup_to(&self, dir: &Path) -> Result<PathBuf> {
        DetectionStore::backup_to(self, dir).await
    }
}

/// `now` minus `days`, or a validation error if that leaves chrono's range
fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::days(i64::from(days)))
        .ok_or_else(|| Error::Validation(format!("window of {} days is out of range", days)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("bad timestamp {:?}: {}", raw, e)))
}

fn row_to_detection(row: SqliteRow) -> Result<DetectionRecord> {
    let classes_json: String = row.try_get("classes")?;
    let classes: Vec<String> = serde_json::from_str(&classes_json)?;

    Ok(DetectionRecord {
        id: row.try_get("id")?,
        timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
        frame_identity: row.try_get("frame_identity")?,
        classes,
        confidence: row.try_get("confidence")?,
        detection_count: row.try_get("detection_count")?,
        image_path: row.try_get("image_path")?,
        processing_time: row.try_get("processing_time")?,
    })
}
