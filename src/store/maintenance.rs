//! Scheduled retention cleanup and backup
//!
//! Runs on its own intervals, never on the write path. The first tick of
//! each interval is skipped so a restart does not trigger an immediate pass.

use super::{PersistenceHandle, PersistenceSink};
use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::error::Result;
use crate::models::{ComponentHealth, Severity, SystemEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

const COMPONENT: &str = "maintenance";

/// Maintenance schedule
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    /// `None` disables backups
    pub backup: Option<(PathBuf, Duration)>,
}

impl From<&crate::config::PersistenceConfig> for MaintenanceConfig {
    fn from(config: &crate::config::PersistenceConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            cleanup_interval: config.cleanup_interval,
            backup: config
                .backup_enabled
                .then(|| (config.backup_dir.clone(), config.backup_interval)),
        }
    }
}

/// Maintenance worker
pub struct MaintenanceWorker<P> {
    sink: Arc<P>,
    config: MaintenanceConfig,
    persistence: PersistenceHandle,
    state: Arc<PipelineState>,
}

impl<P: PersistenceSink> MaintenanceWorker<P> {
    pub fn new(
        sink: Arc<P>,
        config: MaintenanceConfig,
        persistence: PersistenceHandle,
        state: Arc<PipelineState>,
    ) -> Self {
        Self {
            sink,
            config,
            persistence,
            state,
        }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        cleanup.tick().await;

        // Backups disabled: park this branch forever
        let backup_period = self
            .config
            .backup
            .as_ref()
            .map(|(_, every)| *every)
            .unwrap_or(Duration::from_secs(u64::from(u32::MAX)));
        let mut backup = tokio::time::interval(backup_period);
        backup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        backup.tick().await;

        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "scheduled"))
            .await;
        ctx.ready();
        tracing::info!(
            retention_days = self.config.retention_days,
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            backups = self.config.backup.is_some(),
            "Maintenance worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                _ = cleanup.tick() => {
                    self.run_cleanup().await;
                }

                _ = backup.tick(), if self.config.backup.is_some() => {
                    self.run_backup().await;
                }
            }
        }

        tracing::info!("Maintenance worker stopped");
        Ok(())
    }

    /// One retention pass; failures are logged and counted
    pub async fn run_cleanup(&self) {
        match self.sink.cleanup_older_than(self.config.retention_days).await {
            Ok(report) => {
                tracing::info!(
                    detections = report.detections,
                    system_events = report.system_events,
                    performance_metrics = report.performance_metrics,
                    alerts = report.alerts,
                    "Retention cleanup finished"
                );
                if report.total() > 0 {
                    self.persistence.system_event(SystemEvent::new(
                        "retention_cleanup",
                        format!(
                            "removed {} rows older than {} days",
                            report.total(),
                            self.config.retention_days
                        ),
                        Severity::Info,
                    ));
                }
            }
            Err(e) => {
                PipelineCounters::incr(&self.state.counters.persistence_errors);
                tracing::error!(error = %e, "Retention cleanup failed");
            }
        }
    }

    /// One backup pass; failures are logged and counted
    pub async fn run_backup(&self) {
        let Some((dir, _)) = &self.config.backup else {
            return;
        };

        match self.sink.backup_to(dir).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "Database backup created");
                self.persistence.system_event(SystemEvent::new(
                    "backup_created",
                    format!("backup written to {}", path.display()),
                    Severity::Info,
                ));
            }
            Err(e) => {
                PipelineCounters::incr(&self.state.counters.persistence_errors);
                tracing::error!(error = %e, "Database backup failed");
                self.persistence.system_event(SystemEvent::new(
                    "backup_failed",
                    e.to_string(),
                    Severity::Error,
                ));
            }
        }
    }
}
