//! Ingestion - Frame polling worker
//!
//! ## Responsibilities
//!
//! - Poll the frame source on a fixed, cancellable interval
//! - Deliver each frame identity to the detection queue at most once
//! - Never block on a slow consumer (the queue overwrites the oldest frame)
//!
//! A failed poll skips the cycle; a frame that fails to load is skipped
//! until the file changes.

mod seen;

pub use seen::SeenFrames;

use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::error::Result;
use crate::frame_queue::FrameSender;
use crate::frame_source::FrameSource;
use crate::models::ComponentHealth;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

const COMPONENT: &str = "ingestion";

/// Polls a [`FrameSource`] into the frame queue
pub struct IngestionWorker<S> {
    source: Arc<S>,
    frames: FrameSender,
    /// Shared with the coordinator so neither a worker restart nor a
    /// pipeline restart redelivers
    seen: Arc<Mutex<SeenFrames>>,
    poll_interval: Duration,
    state: Arc<PipelineState>,
}

impl<S: FrameSource> IngestionWorker<S> {
    pub fn new(
        source: Arc<S>,
        frames: FrameSender,
        seen: Arc<Mutex<SeenFrames>>,
        poll_interval: Duration,
        state: Arc<PipelineState>,
    ) -> Self {
        Self {
            source,
            frames,
            seen,
            poll_interval,
            state,
        }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut seen = self.seen.lock().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "polling"))
            .await;
        ctx.ready();
        tracing::info!(
            source = self.source.name(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Ingestion worker started"
        );

        let mut healthy = true;
        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    let ok = self.poll_once(&mut seen, &ctx).await;
                    if ok != healthy {
                        healthy = ok;
                        let health = if ok {
                            ComponentHealth::healthy(COMPONENT, "polling")
                        } else {
                            ComponentHealth::unhealthy(COMPONENT, "frame source unreadable")
                        };
                        self.state.report_health(health).await;
                    }
                }
            }
        }

        tracing::info!(seen = seen.len(), "Ingestion worker stopped");
        Ok(())
    }

    /// One poll cycle; false if the source could not be listed
    pub async fn poll_once(&self, seen: &mut SeenFrames, ctx: &WorkerContext) -> bool {
        let counters = &self.state.counters;

        let listing = match self.source.poll().await {
            Ok(listing) => listing,
            Err(e) => {
                PipelineCounters::incr(&counters.ingestion_errors);
                tracing::warn!(source = self.source.name(), error = %e, "Frame source poll failed, skipping cycle");
                return false;
            }
        };

        for meta in &listing {
            if ctx.is_cancelled() {
                break;
            }
            if !seen.should_load(&meta.identity, meta.size_bytes, meta.modified_at) {
                continue;
            }

            match self.source.load(meta).await {
                Ok(frame) => {
                    seen.mark_delivered(&meta.identity);
                    if self.frames.push(Arc::new(frame)) {
                        PipelineCounters::incr(&counters.frames_ingested);
                        tracing::debug!(frame = %meta.identity, size_bytes = meta.size_bytes, "Frame queued");
                    } else {
                        PipelineCounters::incr(&counters.frames_dropped);
                        tracing::warn!(frame = %meta.identity, "Detection queue closed, frame dropped");
                    }
                }
                Err(e) => {
                    seen.mark_failed(&meta.identity, meta.size_bytes, meta.modified_at);
                    PipelineCounters::incr(&counters.ingestion_errors);
                    tracing::warn!(frame = %meta.identity, error = %e, "Frame load failed, skipping");
                }
            }
        }

        let evicted = seen.prune(listing.iter().map(|m| m.identity.as_str()));
        if evicted > 0 {
            tracing::debug!(evicted, remaining = seen.len(), "Evicted old frame identities");
        }
        true
    }
}
