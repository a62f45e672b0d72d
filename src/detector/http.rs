//! HttpDetector - Inference service adapter
//!
//! Posts one frame per request to an external inference service and maps the
//! response into [`Detection`]s.

use super::{postprocess, Detector, DetectorConfig};
use crate::error::{Error, Result};
use crate::models::{ComponentHealth, Detection, Frame};
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

const COMPONENT: &str = "detector";

/// Detection as returned by the inference service
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDetection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// `POST /v1/detect` response body
#[derive(Debug, Clone, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Vec<RemoteDetection>,
}

/// HTTP detector client
pub struct HttpDetector {
    client: reqwest::Client,
    base_url: String,
    config: DetectorConfig,
}

impl HttpDetector {
    /// Create a client; `timeout` bounds each HTTP request
    pub fn new(base_url: impl Into<String>, config: DetectorConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn mime_for(frame: &Frame) -> &'static str {
        let ext = frame
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => "image/png",
            Some("bmp") => "image/bmp",
            _ => "image/jpeg",
        }
    }

    fn build_form(&self, frame: &Frame) -> Result<Form> {
        let part = Part::bytes(frame.image.to_vec())
            .file_name(frame.identity.clone())
            .mime_str(Self::mime_for(frame))?;

        Ok(Form::new()
            .part("image", part)
            .text("confidence_threshold", self.config.confidence_threshold.to_string())
            .text("iou_threshold", self.config.iou_threshold.to_string())
            .text("max_detections", self.config.max_detections.to_string()))
    }

    /// Convert a service response into normalized detections
    pub fn map_response(&self, response: DetectResponse) -> Vec<Detection> {
        let detected_at = Utc::now();
        let detections = response
            .detections
            .into_iter()
            .map(|d| Detection {
                class_name: d.class_name,
                confidence: d.confidence,
                bbox: d.bbox,
                detected_at,
            })
            .collect();
        postprocess(detections, &self.config)
    }
}

impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let url = format!("{}/v1/detect", self.base_url);
        let form = self.build_form(frame)?;

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Detection(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Detection(format!(
                "inference failed: {} - {}",
                status, body
            )));
        }

        let body: DetectResponse = resp
            .json()
            .await
            .map_err(|e| Error::Detection(format!("invalid response: {}", e)))?;

        Ok(self.map_response(body))
    }

    async fn health_check(&self) -> ComponentHealth {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                ComponentHealth::healthy(COMPONENT, "inference service reachable")
            }
            Ok(resp) => ComponentHealth::unhealthy(
                COMPONENT,
                format!("inference service returned {}", resp.status()),
            ),
            Err(e) => ComponentHealth::unhealthy(COMPONENT, format!("unreachable: {}", e)),
        }
    }
}
