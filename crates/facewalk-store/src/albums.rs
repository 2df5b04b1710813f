//! Album enumeration.

use crate::paths::{album_dir, media_path};
use async_trait::async_trait;
use facewalk_core::{Album, MediaRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlbumError {
    #[error("album not found: {0}")]
    NotFound(String),
    #[error("media not found: {0}")]
    MediaNotFound(String),
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("album walk task failed: {0}")]
    Join(String),
}

#[async_trait]
pub trait AlbumSource: Send + Sync {
    /// Every folder album, ordered by key.
    async fn list_albums(&self) -> Result<Vec<Album>, AlbumError>;

    /// Media entries of one album, in enumeration order.
    async fn read_entries(&self, album: &Album) -> Result<Vec<MediaRef>, AlbumError>;

    async fn read_media(&self, media: &MediaRef) -> Result<Vec<u8>, AlbumError>;

    async fn exists(&self, media: &MediaRef) -> bool;
}

/// Albums are the directories under `root` that directly contain pictures.
pub struct FsAlbumSource {
    root: PathBuf,
}

impl FsAlbumSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AlbumError + '_ {
    move |source| AlbumError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Sorted picture file names directly inside `dir`.
fn picture_names(dir: &Path, album: &Album) -> Result<Vec<String>, AlbumError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_hidden(&name) || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if MediaRef::new(album.clone(), name.as_str()).is_picture() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn walk_albums(root: &Path) -> Result<Vec<Album>, AlbumError> {
    let mut albums = Vec::new();
    let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, key)) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_hidden(&name) || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let child_key = if key.is_empty() { name.clone() } else { format!("{key}/{name}") };
            let album = Album::folder(child_key.clone(), name);
            let child_dir = entry.path();
            match picture_names(&child_dir, &album) {
                Ok(pictures) if !pictures.is_empty() => albums.push(album),
                Ok(_) => {}
                Err(e) => tracing::warn!(dir = %child_dir.display(), error = %e, "skipping unreadable folder"),
            }
            stack.push((child_dir, child_key));
        }
    }

    albums.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(albums)
}

#[async_trait]
impl AlbumSource for FsAlbumSource {
    async fn list_albums(&self) -> Result<Vec<Album>, AlbumError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_albums(&root))
            .await
            .map_err(|e| AlbumError::Join(e.to_string()))?
    }

    async fn read_entries(&self, album: &Album) -> Result<Vec<MediaRef>, AlbumError> {
        let dir = album_dir(&self.root, &album.key);
        if !dir.is_dir() {
            return Err(AlbumError::NotFound(album.key.clone()));
        }
        let owned = album.clone();
        let names = tokio::task::spawn_blocking(move || picture_names(&dir, &owned))
            .await
            .map_err(|e| AlbumError::Join(e.to_string()))??;
        Ok(names
            .into_iter()
            .map(|name| MediaRef::new(album.clone(), name))
            .collect())
    }

    async fn read_media(&self, media: &MediaRef) -> Result<Vec<u8>, AlbumError> {
        let path = media_path(&self.root, media);
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AlbumError::MediaNotFound(media.to_string())
            } else {
                AlbumError::Io { path, source }
            }
        })
    }

    async fn exists(&self, media: &MediaRef) -> bool {
        tokio::fs::try_exists(media_path(&self.root, media))
            .await
            .unwrap_or(false)
    }
}

/// In-memory albums, for tests and dry runs.
#[derive(Default)]
pub struct MemoryAlbumSource {
    albums: Mutex<BTreeMap<String, (Album, BTreeMap<String, Vec<u8>>)>>,
}

impl MemoryAlbumSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, album: &Album, name: &str, bytes: Vec<u8>) -> MediaRef {
        let mut albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        albums
            .entry(album.key.clone())
            .or_insert_with(|| (album.clone(), BTreeMap::new()))
            .1
            .insert(name.to_string(), bytes);
        MediaRef::new(album.clone(), name)
    }

    pub fn remove_entry(&self, media: &MediaRef) {
        let mut albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, entries)) = albums.get_mut(&media.album.key) {
            entries.remove(&media.name);
        }
    }
}

#[async_trait]
impl AlbumSource for MemoryAlbumSource {
    async fn list_albums(&self) -> Result<Vec<Album>, AlbumError> {
        let albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(albums.values().map(|(album, _)| album.clone()).collect())
    }

    async fn read_entries(&self, album: &Album) -> Result<Vec<MediaRef>, AlbumError> {
        let albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, entries) = albums
            .get(&album.key)
            .ok_or_else(|| AlbumError::NotFound(album.key.clone()))?;
        Ok(entries
            .keys()
            .map(|name| MediaRef::new(album.clone(), name.as_str()))
            .collect())
    }

    async fn read_media(&self, media: &MediaRef) -> Result<Vec<u8>, AlbumError> {
        let albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        albums
            .get(&media.album.key)
            .and_then(|(_, entries)| entries.get(&media.name))
            .cloned()
            .ok_or_else(|| AlbumError::MediaNotFound(media.to_string()))
    }

    async fn exists(&self, media: &MediaRef) -> bool {
        let albums = self.albums.lock().unwrap_or_else(PoisonError::into_inner);
        albums
            .get(&media.album.key)
            .is_some_and(|(_, entries)| entries.contains_key(&media.name))
    }
}
