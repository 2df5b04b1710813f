//! Per-entry cache of detected face features.
//!
//! One JSON file per media item, at a path mirroring the album key under the
//! cache root. A missing file means the entry was never scanned; an empty
//! list means it was scanned and yielded nothing (or the detector failed).

use crate::debounce::DebouncedWriter;
use crate::paths::album_dir;
use facewalk_core::{FeatureRecord, MediaRef};
use std::path::PathBuf;

#[derive(Clone)]
pub struct FeatureCache {
    root: PathBuf,
    writer: DebouncedWriter,
}

impl FeatureCache {
    pub fn new(root: impl Into<PathBuf>, writer: DebouncedWriter) -> Self {
        Self {
            root: root.into(),
            writer,
        }
    }

    pub fn path_for(&self, media: &MediaRef) -> PathBuf {
        album_dir(&self.root, &media.album.key).join(format!("{}.json", media.name))
    }

    /// Cached features, preferring a pending write over the file on disk.
    ///
    /// Unreadable or corrupt files read as absent.
    pub async fn read(&self, media: &MediaRef) -> Option<Vec<FeatureRecord>> {
        let path = self.path_for(media);
        let bytes = match self.writer.peek(&path).await {
            Some(pending) => pending,
            None => tokio::fs::read(&path).await.ok()?,
        };
        match serde_json::from_slice(&bytes) {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "ignoring corrupt feature cache");
                None
            }
        }
    }

    /// Queue a debounced write of the full feature list for `media`.
    pub fn write(&self, media: &MediaRef, records: &[FeatureRecord]) {
        match serde_json::to_vec(records) {
            Ok(bytes) => self.writer.write(self.path_for(media), bytes),
            Err(e) => tracing::warn!(media = %media, error = %e, "failed to encode features"),
        }
    }

    pub async fn flush(&self) -> usize {
        self.writer.flush().await
    }
}
