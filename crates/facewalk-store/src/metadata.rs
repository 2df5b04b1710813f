//! Per-album key/value metadata.
//!
//! Each album carries named sections (one per entry, plus `Contacts2` and
//! face-instance back-references in face albums), each a flat map of
//! string fields. Writes are last-writer-wins; concurrent writers to the
//! same album file are serialized by a per-path lock.

use crate::paths::{album_dir, write_atomic};
use async_trait::async_trait;
use facewalk_core::{Album, AlbumKind};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub type Section = BTreeMap<String, String>;
pub type Sections = BTreeMap<String, Section>;

/// Metadata file name inside a folder album.
const FOLDER_METADATA_FILE: &str = ".facewalk.json";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt metadata in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn read_all(&self, album: &Album) -> Result<Sections, MetadataError>;

    async fn read_field(&self, album: &Album, section: &str, field: &str) -> Result<Option<String>, MetadataError> {
        Ok(self
            .read_all(album)
            .await?
            .get(section)
            .and_then(|s| s.get(field))
            .cloned())
    }

    /// Set a field, or delete it when `value` is `None`. Empty sections are dropped.
    async fn write_field(
        &self,
        album: &Album,
        section: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<(), MetadataError>;
}

fn apply_field(sections: &mut Sections, section: &str, field: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            sections
                .entry(section.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        }
        None => {
            if let Some(s) = sections.get_mut(section) {
                s.remove(field);
                if s.is_empty() {
                    sections.remove(section);
                }
            }
        }
    }
}

/// JSON file per album: `<images>/<album>/.facewalk.json` for folders,
/// `<faces>/albums/<key>.json` for face albums.
pub struct JsonMetadataStore {
    images_root: PathBuf,
    faces_root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonMetadataStore {
    pub fn new(images_root: impl Into<PathBuf>, faces_root: impl Into<PathBuf>) -> Self {
        Self {
            images_root: images_root.into(),
            faces_root: faces_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, album: &Album) -> PathBuf {
        match album.kind {
            AlbumKind::Folder => album_dir(&self.images_root, &album.key).join(FOLDER_METADATA_FILE),
            AlbumKind::Face => {
                let file = album.key.replace(['/', '\\'], "_");
                self.faces_root.join("albums").join(format!("{file}.json"))
            }
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    async fn load(path: &Path) -> Result<Sections, MetadataError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| MetadataError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sections::new()),
            Err(source) => Err(MetadataError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn read_all(&self, album: &Album) -> Result<Sections, MetadataError> {
        Self::load(&self.path_for(album)).await
    }

    async fn write_field(
        &self,
        album: &Album,
        section: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<(), MetadataError> {
        let path = self.path_for(album);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let mut sections = Self::load(&path).await?;
        apply_field(&mut sections, section, field, value);

        let bytes = serde_json::to_vec_pretty(&sections).map_err(|source| MetadataError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| MetadataError::Io { path, source })
    }
}

/// In-memory store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryMetadataStore {
    albums: Mutex<HashMap<(AlbumKind, String), Sections>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous view of one album's sections.
    pub fn snapshot(&self, album: &Album) -> Sections {
        let albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        albums
            .get(&(album.kind, album.key.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn read_all(&self, album: &Album) -> Result<Sections, MetadataError> {
        Ok(self.snapshot(album))
    }

    async fn write_field(
        &self,
        album: &Album,
        section: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<(), MetadataError> {
        let mut albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        let sections = albums.entry((album.kind, album.key.clone())).or_default();
        apply_field(sections, section, field, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_paths() {
        let store = JsonMetadataStore::new("/photos", "/data/faces");
        assert_eq!(
            store.path_for(&Album::folder("2021/trip", "trip")),
            PathBuf::from("/photos/2021/trip/.facewalk.json")
        );
        assert_eq!(
            store.path_for(&Album::face("face:Ada Lovelace", "Ada Lovelace")),
            PathBuf::from("/data/faces/albums/face:Ada Lovelace.json")
        );
    }

    #[tokio::test]
    async fn test_json_store_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMetadataStore::new(dir.path().join("images"), dir.path().join("faces"));
        let album = Album::folder("a", "a");

        assert!(store.read_all(&album).await.unwrap().is_empty());
        store.write_field(&album, "IMG_1.jpg", "faces", Some("rect64(1),h")).await.unwrap();
        store.write_field(&album, "Contacts2", "h", Some("Ada;;")).await.unwrap();
        assert_eq!(
            store.read_field(&album, "IMG_1.jpg", "faces").await.unwrap().as_deref(),
            Some("rect64(1),h")
        );

        store.write_field(&album, "IMG_1.jpg", "faces", None).await.unwrap();
        let all = store.read_all(&album).await.unwrap();
        assert!(!all.contains_key("IMG_1.jpg"));
        assert_eq!(all["Contacts2"]["h"], "Ada;;");
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMetadataStore::new(dir.path(), dir.path().join("faces"));
        let album = Album::folder("a", "a");
        let path = store.path_for(&album);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"nope").await.unwrap();

        assert!(matches!(store.read_all(&album).await, Err(MetadataError::Corrupt { .. })));
        // Corrupt files are not clobbered by writes.
        assert!(store.write_field(&album, "s", "f", Some("v")).await.is_err());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"nope");
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_lose_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonMetadataStore::new(dir.path(), dir.path().join("faces")));
        let album = Album::folder("a", "a");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let album = album.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .write_field(&album, "s", &format!("f{i}"), Some("v"))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.read_all(&album).await.unwrap()["s"].len(), 16);
    }

    #[tokio::test]
    async fn test_memory_store_separates_kinds() {
        let store = MemoryMetadataStore::new();
        let folder = Album::folder("x", "x");
        let face = Album::face("x", "x");
        store.write_field(&folder, "s", "f", Some("folder")).await.unwrap();
        store.write_field(&face, "s", "f", Some("face")).await.unwrap();
        assert_eq!(store.read_field(&folder, "s", "f").await.unwrap().as_deref(), Some("folder"));
        assert_eq!(store.snapshot(&face)["s"]["f"], "face");
    }
}
