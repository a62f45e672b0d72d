//! Iron Dome Library
//!
//! Local detection pipeline: frames from a capture directory are run through
//! an inference service, persisted, and turned into alerts and deterrence.
//!
//! ## Architecture
//!
//! 1. FrameSource - lists and loads captured frames
//! 2. Ingestion - dedup and hand-off into the bounded FrameQueue
//! 3. Detector - inference adapter with a per-call timeout
//! 4. DetectionWorker - runs frames through the detector, fans events out
//! 5. AlertEngine - threshold/cooldown decision over detection events
//! 6. Prevention - deterrence actions dispatched on fired alerts
//! 7. Health - host resource sampling and component health
//! 8. Store - SQLite persistence, retention and backup
//! 9. RealtimeHub - WebSocket distribution
//! 10. Coordinator - supervised lifecycle of all workers
//! 11. WebAPI - status and history endpoints
//!
//! ## Design Principles
//!
//! - Every worker stops on one cancellation token
//! - No stage blocks another: queues are bounded and drop oldest
//! - Status reads never wait on a worker

pub mod alert_engine;
pub mod config;
pub mod coordinator;
pub mod detection_worker;
pub mod detector;
pub mod error;
pub mod frame_queue;
pub mod frame_source;
pub mod health;
pub mod ingestion;
pub mod models;
pub mod prevention;
pub mod realtime_hub;
pub mod state;
pub mod store;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
