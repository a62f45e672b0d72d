//! FrameSource - Where frames come from
//!
//! ## Responsibilities
//!
//! - List frames currently available with stable identities
//! - Load one listed frame into memory
//!
//! Re-polling an unprocessed item must yield the same identity. Dedup is
//! the ingestion worker's job, not the source's.

mod directory;

pub use directory::{DirectoryFrameSource, IMAGE_EXTENSIONS};

use crate::error::Result;
use crate::models::{Frame, FrameMeta};
use std::future::Future;

/// External frame capability consumed by the ingestion worker
pub trait FrameSource: Send + Sync + 'static {
    /// Source name recorded on every frame
    fn name(&self) -> &str;

    /// Currently available frames, oldest first
    fn poll(&self) -> impl Future<Output = Result<Vec<FrameMeta>>> + Send;

    /// Read the image for a listed frame
    fn load(&self, meta: &FrameMeta) -> impl Future<Output = Result<Frame>> + Send;
}
