//! Capture folder frame source

use super::FrameSource;
use crate::error::{Error, Result};
use crate::models::{Frame, FrameMeta};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

/// File extensions treated as frames (case-insensitive)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Polls a folder that an external capture tool drops images into
pub struct DirectoryFrameSource {
    name: String,
    dir: PathBuf,
}

impl DirectoryFrameSource {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                IMAGE_EXTENSIONS.contains(&e.as_str())
            })
            .unwrap_or(false)
    }
}

impl FrameSource for DirectoryFrameSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Vec<FrameMeta>> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Ingestion(format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            Error::Ingestion(format!("cannot list {}: {}", self.dir.display(), e))
        })?;

        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !Self::is_image(&path) {
                continue;
            }

            // Files can vanish between listing and stat
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let Some(identity) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };

            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            frames.push(FrameMeta {
                source: self.name.clone(),
                identity,
                path,
                size_bytes: metadata.len(),
                modified_at,
            });
        }

        frames.sort_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });

        Ok(frames)
    }

    async fn load(&self, meta: &FrameMeta) -> Result<Frame> {
        let image = fs::read(&meta.path).await.map_err(|e| {
            Error::Ingestion(format!("cannot read {}: {}", meta.path.display(), e))
        })?;

        if image.is_empty() {
            return Err(Error::Ingestion(format!(
                "frame {} is empty",
                meta.identity
            )));
        }

        Ok(Frame::from_meta(meta, image, Utc::now()))
    }
}
