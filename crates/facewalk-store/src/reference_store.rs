//! Global store of one reference feature per identity.
//!
//! Held in memory and persisted as a single JSON object through the
//! debounced writer after every mutation.

use crate::debounce::DebouncedWriter;
use facewalk_core::{FeatureRecord, IdentityHash, ReferenceMap};
use std::path::{Path, PathBuf};

pub struct ReferenceStore {
    path: PathBuf,
    writer: DebouncedWriter,
    references: ReferenceMap,
}

impl ReferenceStore {
    /// Best-effort load: a missing or corrupt file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>, writer: DebouncedWriter) -> Self {
        let path = path.into();
        let references = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "reference features unreadable; starting empty");
                ReferenceMap::new()
            }),
            Err(_) => ReferenceMap::new(),
        };
        tracing::info!(path = %path.display(), count = references.len(), "reference features loaded");
        Self {
            path,
            writer,
            references,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &ReferenceMap {
        &self.references
    }

    pub fn get_feature(&self, hash: &IdentityHash) -> Option<&FeatureRecord> {
        self.references.get(hash)
    }

    pub fn contains(&self, hash: &IdentityHash) -> bool {
        self.references.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Set the reference for `hash`, returning the one it replaced.
    pub fn insert(&mut self, hash: IdentityHash, feature: FeatureRecord) -> Option<FeatureRecord> {
        let previous = self.references.insert(hash, feature);
        self.persist();
        previous
    }

    pub fn remove(&mut self, hash: &IdentityHash) -> Option<FeatureRecord> {
        let removed = self.references.remove(hash);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        match serde_json::to_vec(&self.references) {
            Ok(bytes) => self.writer.write(self.path.clone(), bytes),
            Err(e) => tracing::warn!(error = %e, "failed to encode reference features"),
        }
    }

    pub async fn flush(&self) -> usize {
        self.writer.flush().await
    }
}
