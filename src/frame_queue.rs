//! Bounded frame queue between ingestion and detection
//!
//! A single-consumer ring on top of `tokio::sync::broadcast`. When the ring
//! is full the oldest unconsumed frame is overwritten, so the producer never
//! blocks; the consumer learns how many frames it missed on its next receive.

use crate::models::Frame;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Create a frame queue holding at least `capacity` frames
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

/// What the consumer sees on each receive
#[derive(Debug)]
pub enum QueueEvent {
    Frame(Arc<Frame>),
    /// Frames overwritten before they could be consumed
    Dropped(u64),
}

/// Producer half; cheap to clone
#[derive(Clone)]
pub struct FrameSender {
    tx: broadcast::Sender<Arc<Frame>>,
}

impl FrameSender {
    /// Enqueue a frame without blocking; false if the consumer is gone
    pub fn push(&self, frame: Arc<Frame>) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Frames currently buffered
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

/// Consumer half
pub struct FrameReceiver {
    rx: broadcast::Receiver<Arc<Frame>>,
}

impl FrameReceiver {
    /// Wait for the next frame; `None` once every sender is dropped
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        match self.rx.recv().await {
            Ok(frame) => Some(QueueEvent::Frame(frame)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(QueueEvent::Dropped(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
