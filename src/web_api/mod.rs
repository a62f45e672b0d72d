//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Health and pipeline status
//! - Windowed reads over persisted detections, events, metrics and alerts
//! - WebSocket feed backed by the RealtimeHub

mod routes;

pub use routes::{create_router, WindowQuery};
