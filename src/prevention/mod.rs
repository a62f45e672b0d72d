//! Prevention - Actions run when an alert fires
//!
//! ## Responsibilities
//!
//! - Build the action list from configuration
//! - Run every action concurrently; one failure never blocks the others
//! - Report failures so the caller can count them

use crate::alert_engine::Alert;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::models::format_timestamp;
use futures::future::join_all;
use serde_json::json;
use std::time::Duration;

/// One configured prevention action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreventionAction {
    /// Console banner
    Alert,
    /// Warning-level log line
    Log,
    /// Structured notification event for log shippers
    Notification,
    /// Email notification; recorded in the log, no mail transport is wired
    Email { to: Option<String> },
    /// JSON POST to an external endpoint
    Webhook { url: String },
}

impl PreventionAction {
    pub fn name(&self) -> &'static str {
        match self {
            PreventionAction::Alert => "alert",
            PreventionAction::Log => "log",
            PreventionAction::Notification => "notification",
            PreventionAction::Email { .. } => "email",
            PreventionAction::Webhook { .. } => "webhook",
        }
    }

    async fn execute(&self, alert: &Alert, client: &reqwest::Client) -> Result<()> {
        let classes = alert.classes.iter().cloned().collect::<Vec<_>>();
        match self {
            PreventionAction::Alert => {
                let rule = "=".repeat(60);
                eprintln!(
                    "\n{rule}\nDETECTION ALERT\n{rule}\nTime: {}\nDetections: {}\nClasses detected: {:?}\nConfidence: {:.2}\n{rule}\n",
                    alert.fired_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.detection_count,
                    classes,
                    alert.max_confidence,
                );
                Ok(())
            }
            PreventionAction::Log => {
                tracing::warn!(
                    detection_count = alert.detection_count,
                    classes = ?classes,
                    confidence = alert.max_confidence,
                    "ALERT: detection threshold reached"
                );
                Ok(())
            }
            PreventionAction::Notification => {
                tracing::info!(
                    target: "iron_dome::notification",
                    alert_type = %alert.alert_type,
                    severity = %alert.severity,
                    fired_at = %format_timestamp(alert.fired_at),
                    message = %alert.message,
                    "Notification sent"
                );
                Ok(())
            }
            PreventionAction::Email { to } => {
                tracing::info!(
                    target: "iron_dome::email",
                    to = to.as_deref().unwrap_or("(unset)"),
                    subject = %format!("Detection alert: {} detections", alert.detection_count),
                    classes = ?classes,
                    fired_at = %format_timestamp(alert.fired_at),
                    body = %alert.message,
                    "Email alert recorded"
                );
                Ok(())
            }
            PreventionAction::Webhook { url } => {
                let payload = json!({
                    "alert_type": alert.alert_type,
                    "timestamp": format_timestamp(alert.fired_at),
                    "detection_count": alert.detection_count,
                    "classes": classes,
                    "confidence": alert.max_confidence,
                    "frame": alert.frame_identity,
                    "message": alert.message,
                    "severity": alert.severity,
                });

                let resp = client.post(url).json(&payload).send().await.map_err(|e| {
                    Error::Action {
                        action: self.name().to_string(),
                        message: e.to_string(),
                    }
                })?;

                if !resp.status().is_success() {
                    return Err(Error::Action {
                        action: self.name().to_string(),
                        message: format!("webhook returned {}", resp.status()),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Outcome of running all actions for one alert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

/// Runs the configured actions
pub struct PreventionDispatcher {
    actions: Vec<PreventionAction>,
    client: reqwest::Client,
}

impl PreventionDispatcher {
    pub fn new(actions: Vec<PreventionAction>, webhook_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(webhook_timeout).build()?;
        Ok(Self { actions, client })
    }

    /// Build from configuration; disabled prevention yields no actions
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let prevention = &config.alert.prevention;
        let mut actions = Vec::new();

        for method in config.active_prevention_methods() {
            let action = match method.as_str() {
                "alert" => PreventionAction::Alert,
                "log" => PreventionAction::Log,
                "notification" => PreventionAction::Notification,
                "email" => PreventionAction::Email {
                    to: prevention.email_to.clone(),
                },
                "webhook" => match &prevention.webhook_url {
                    Some(url) => PreventionAction::Webhook { url: url.clone() },
                    None => {
                        return Err(Error::Config(
                            "webhook prevention method requires a URL".to_string(),
                        ))
                    }
                },
                _ => continue,
            };
            if !actions.contains(&action) {
                actions.push(action);
            }
        }

        Self::new(actions, prevention.webhook_timeout)
    }

    pub fn actions(&self) -> &[PreventionAction] {
        &self.actions
    }

    /// Run every action; failures are logged and reported, never propagated
    pub async fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let results = join_all(
            self.actions
                .iter()
                .map(|action| async move { (action.name(), action.execute(alert, &self.client).await) }),
        )
        .await;

        let mut report = DispatchReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(e) => {
                    tracing::error!(action = name, error = %e, "Prevention action failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }
}
