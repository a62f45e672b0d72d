//! Iron Dome - local insect detection and deterrence
//!
//! Main entry point: starts the pipeline and serves the status API.

use iron_dome::{
    config::PipelineConfig,
    coordinator::Coordinator,
    detector::{DetectorConfig, HttpDetector},
    frame_source::DirectoryFrameSource,
    realtime_hub::RealtimeHub,
    state::{AppConfig, AppState},
    store::DetectionStore,
    web_api,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iron_dome=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Iron Dome v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let pipeline_config = PipelineConfig::from_env()?;
    let config = AppConfig::default();
    tracing::info!(
        capture_dir = %pipeline_config.ingestion.capture_dir.display(),
        database = %pipeline_config.persistence.database_path.display(),
        detector_url = %config.detector_url,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&pipeline_config.ingestion.capture_dir).await?;

    // Components
    let store = DetectionStore::connect(&pipeline_config.persistence.database_path).await?;
    let realtime = Arc::new(RealtimeHub::new());
    let source = DirectoryFrameSource::new(
        pipeline_config.ingestion.source_name.clone(),
        pipeline_config.ingestion.capture_dir.clone(),
    );
    let detector = HttpDetector::new(
        config.detector_url.clone(),
        DetectorConfig::from(&pipeline_config.detection),
        pipeline_config.detection.detector_timeout,
    )?;

    let pipeline = Arc::new(Coordinator::new(
        Arc::new(source),
        Arc::new(detector),
        Arc::new(store.clone()),
        realtime.clone(),
    ));
    pipeline.start(pipeline_config).await?;

    let state = AppState {
        config: config.clone(),
        store,
        pipeline: pipeline.clone(),
        realtime,
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Stop the pipeline even if the server failed, then report the failure
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed, stopping pipeline");
    }

    let report = pipeline.stop(config.shutdown_timeout).await?;
    if report.is_clean() {
        tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "Shutdown complete");
    } else {
        tracing::warn!(
            timed_out = ?report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown finished with stuck workers"
        );
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Shutdown signal received");
}
