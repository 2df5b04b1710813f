//! Mapping of album keys onto directory trees.

use facewalk_core::MediaRef;
use std::path::{Path, PathBuf};

/// Directory mirroring `album_key` under `root`.
///
/// Empty, `.` and `..` components are dropped so a key can never escape `root`.
pub fn album_dir(root: &Path, album_key: &str) -> PathBuf {
    album_key
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(root.to_path_buf(), |dir, component| dir.join(component))
}

/// Location of a media file under the images root.
pub fn media_path(root: &Path, media: &MediaRef) -> PathBuf {
    album_dir(root, &media.album.key).join(&media.name)
}

/// Write through a sibling temp file and rename over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewalk_core::Album;

    #[test]
    fn test_album_dir_mirrors_key() {
        let root = Path::new("/cache");
        assert_eq!(album_dir(root, "2021/summer/beach"), PathBuf::from("/cache/2021/summer/beach"));
    }

    #[test]
    fn test_album_dir_cannot_escape_root() {
        let root = Path::new("/cache");
        assert_eq!(album_dir(root, "../../etc//./x"), PathBuf::from("/cache/etc/x"));
    }

    #[test]
    fn test_media_path() {
        let media = MediaRef::new(Album::folder("a/b", "b"), "IMG_1.jpg");
        assert_eq!(media_path(Path::new("/photos"), &media), PathBuf::from("/photos/a/b/IMG_1.jpg"));
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/file.json");
        write_atomic(&target, b"[]").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"[]");
        assert!(!dir.path().join("deep/nested/file.json.tmp").exists());
    }
}
