//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::health::HealthLevel;
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::store::{AlertRecord, AnalyticsSummary, DetectionRecord, MetricRecord, SystemEventRecord};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;
const MAX_DAYS: u32 = 365;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/status", get(pipeline_status))
        .route("/api/detections", get(list_detections))
        .route("/api/events", get(list_events))
        .route("/api/metrics", get(list_metrics))
        .route("/api/alerts", get(list_alerts))
        .route("/api/analytics", get(analytics))
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Health / Status
// ========================================

/// Liveness plus overall pipeline level; 503 when down
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pipeline.status().await;
    let db_connected = state.store.ping().await;

    let code = if status.overall == HealthLevel::Down || !db_connected {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(json!({
            "status": status.overall,
            "running": status.running,
            "db_connected": db_connected,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_sec": status.uptime_secs,
        })),
    )
}

/// Full pipeline status snapshot
async fn pipeline_status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let status = state.pipeline.status().await;
    let tables = state.store.table_counts().await?;

    Ok(Json(ApiResponse::success(json!({
        "pipeline": status,
        "tables": tables,
        "realtime_clients": state.realtime.connection_count(),
    }))))
}

// ========================================
// Window queries
// ========================================

/// Query parameters for windowed listings
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    days: Option<u32>,
    limit: Option<u32>,
}

impl WindowQuery {
    /// Resolve to (days, limit), rejecting out-of-range values
    fn resolve(&self) -> Result<(u32, u32)> {
        let days = self.days.unwrap_or(1);
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);

        if days == 0 || days > MAX_DAYS {
            return Err(Error::Validation(format!("days must be between 1 and {}", MAX_DAYS)));
        }
        if limit == 0 || limit > MAX_LIMIT {
            return Err(Error::Validation(format!("limit must be between 1 and {}", MAX_LIMIT)));
        }
        Ok((days, limit))
    }

    fn since(days: u32) -> chrono::DateTime<Utc> {
        Utc::now() - ChronoDuration::days(i64::from(days))
    }
}

async fn list_detections(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<DetectionRecord>>>> {
    let (days, limit) = query.resolve()?;
    let rows = state.store.detections(WindowQuery::since(days), limit).await?;
    Ok(Json(ApiResponse::success(rows)))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<SystemEventRecord>>>> {
    let (days, limit) = query.resolve()?;
    let rows = state.store.system_events(WindowQuery::since(days), limit).await?;
    Ok(Json(ApiResponse::success(rows)))
}

async fn list_metrics(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<MetricRecord>>>> {
    let (days, limit) = query.resolve()?;
    let rows = state.store.metrics(WindowQuery::since(days), limit).await?;
    Ok(Json(ApiResponse::success(rows)))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<Vec<AlertRecord>>>> {
    let (days, limit) = query.resolve()?;
    let rows = state.store.alerts(WindowQuery::since(days), limit).await?;
    Ok(Json(ApiResponse::success(rows)))
}

async fn analytics(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ApiResponse<AnalyticsSummary>>> {
    let days = query.days.unwrap_or(7);
    if days == 0 || days > MAX_DAYS {
        return Err(Error::Validation(format!("days must be between 1 and {}", MAX_DAYS)));
    }
    let summary = state.store.analytics(days).await?;
    Ok(Json(ApiResponse::success(summary)))
}

// ========================================
// WebSocket
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Forward hub messages to one WebSocket client
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = state.realtime.register().await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Inbound traffic is only watched for close
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.realtime.unregister(&conn_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::detector::{DetectorConfig, HttpDetector};
    use crate::frame_source::DirectoryFrameSource;
    use crate::models::{Detection, DetectionEvent};
    use crate::realtime_hub::RealtimeHub;
    use crate::state::AppConfig;
    use crate::store::DetectionStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn app_state(dir: &std::path::Path) -> AppState {
        let store = DetectionStore::in_memory().await.unwrap();
        let realtime = Arc::new(RealtimeHub::new());
        let detector = HttpDetector::new(
            "http://127.0.0.1:9",
            DetectorConfig::default(),
            Duration::from_millis(200),
        )
        .unwrap();
        let pipeline = Coordinator::new(
            Arc::new(DirectoryFrameSource::new("test", dir)),
            Arc::new(detector),
            Arc::new(store.clone()),
            realtime.clone(),
        );

        AppState {
            config: AppConfig::default(),
            store,
            pipeline: Arc::new(pipeline),
            realtime,
        }
    }

    #[test]
    fn test_window_query_bounds() {
        assert_eq!(WindowQuery::default().resolve().unwrap(), (1, DEFAULT_LIMIT));

        let too_many = WindowQuery {
            days: Some(1),
            limit: Some(MAX_LIMIT + 1),
        };
        assert!(matches!(too_many.resolve(), Err(Error::Validation(_))));

        let zero_days = WindowQuery {
            days: Some(0),
            limit: None,
        };
        assert!(matches!(zero_days.resolve(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_list_detections_reads_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;
        let event = DetectionEvent::new(
            "frame_7.jpg",
            None,
            vec![Detection {
                class_name: "wasp".into(),
                confidence: 0.66,
                bbox: [0.0; 4],
                detected_at: Utc::now(),
            }],
            Utc::now(),
            Duration::from_millis(5),
        );
        state.store.insert_detection(&event).await.unwrap();

        let Json(response) = list_detections(State(state), Query(WindowQuery::default()))
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_reports_stopped_pipeline_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let response = health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
