//! Persistence hand-off
//!
//! Producers enqueue records through a cloneable [`PersistenceHandle`]
//! without ever awaiting I/O. A single [`PersistenceWriter`] worker drains
//! the queue into the sink, retrying a failed write once. Pending records
//! are flushed when the writer is asked to stop.

use super::{MetricsSample, PersistenceRecord, PersistenceSink};
use crate::alert_engine::Alert;
use crate::coordinator::{PipelineCounters, PipelineState, WorkerContext};
use crate::error::Result;
use crate::models::{ComponentHealth, DetectionEvent, SystemEvent};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

const COMPONENT: &str = "persistence";

/// Create the bounded hand-off queue
pub fn persistence_channel(
    capacity: usize,
    state: Arc<PipelineState>,
) -> (PersistenceHandle, PersistenceQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PersistenceHandle { tx, state },
        PersistenceQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Non-blocking producer side
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistenceRecord>,
    state: Arc<PipelineState>,
}

impl PersistenceHandle {
    /// Enqueue a record; a full or closed queue drops it and counts the drop
    pub fn record(&self, record: PersistenceRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                PipelineCounters::incr(&self.state.counters.persistence_dropped);
                tracing::warn!(kind = record.kind(), "Persistence queue full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                PipelineCounters::incr(&self.state.counters.persistence_dropped);
                tracing::warn!(kind = record.kind(), "Persistence writer gone, dropping record");
            }
        }
    }

    pub fn detection(&self, event: Arc<DetectionEvent>) {
        self.record(PersistenceRecord::Detection(event));
    }

    pub fn system_event(&self, event: SystemEvent) {
        self.record(PersistenceRecord::SystemEvent(event));
    }

    pub fn metrics(&self, sample: MetricsSample) {
        self.record(PersistenceRecord::Metrics(sample));
    }

    pub fn alert(&self, alert: Alert) {
        self.record(PersistenceRecord::Alert(alert));
    }

    /// Records waiting to be written
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Consumer side, shared across writer restarts
#[derive(Clone)]
pub struct PersistenceQueue {
    rx: Arc<Mutex<mpsc::Receiver<PersistenceRecord>>>,
}

/// Drains the queue into the sink
pub struct PersistenceWriter<P> {
    sink: Arc<P>,
    queue: PersistenceQueue,
    state: Arc<PipelineState>,
}

impl<P: PersistenceSink> PersistenceWriter<P> {
    pub fn new(sink: Arc<P>, queue: PersistenceQueue, state: Arc<PipelineState>) -> Self {
        Self { sink, queue, state }
    }

    pub async fn run(&self, ctx: WorkerContext) -> Result<()> {
        let mut rx = self.queue.rx.lock().await;
        self.state
            .report_health(ComponentHealth::healthy(COMPONENT, "running"))
            .await;
        ctx.ready();
        tracing::info!("Persistence writer started");

        loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => break,

                record = rx.recv() => match record {
                    Some(record) => self.write(record).await,
                    None => {
                        tracing::info!("Persistence queue closed");
                        return Ok(());
                    }
                },
            }
        }

        let mut drained = 0usize;
        while let Ok(record) = rx.try_recv() {
            self.write(record).await;
            drained += 1;
        }
        tracing::info!(drained, "Persistence writer stopped");
        Ok(())
    }

    async fn write(&self, record: PersistenceRecord) {
        let counters = &self.state.counters;

        let result = match self.sink.write(&record).await {
            Ok(()) => Ok(()),
            Err(first) => {
                PipelineCounters::incr(&counters.persistence_retries);
                tracing::warn!(kind = record.kind(), error = %first, "Persistence write failed, retrying once");
                self.sink.write(&record).await
            }
        };

        match result {
            Ok(()) => {
                PipelineCounters::incr(&counters.persistence_writes);
                if !self.is_healthy().await {
                    self.state
                        .report_health(ComponentHealth::healthy(COMPONENT, "writes succeeding"))
                        .await;
                }
            }
            Err(e) => {
                PipelineCounters::incr(&counters.persistence_errors);
                tracing::error!(kind = record.kind(), error = %e, "Persistence write dropped after retry");
                self.state
                    .report_health(ComponentHealth::unhealthy(
                        COMPONENT,
                        format!("last write failed: {}", e),
                    ))
                    .await;
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        self.state
            .component(COMPONENT)
            .await
            .map(|h| h.healthy)
            .unwrap_or(false)
    }
}
