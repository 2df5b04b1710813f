//! Face crop export.
//!
//! Artifacts live at `<out>/<identity hash>/<face key>.jpg` and are
//! overwritten on every export.

use crate::paths::media_path;
use async_trait::async_trait;
use facewalk_core::{FaceBox, FaceLocator, MediaRef};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest side of an exported crop, in pixels.
const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("face box {0:?} is empty after clamping to the image")]
    EmptyCrop(FaceBox),
    #[error("crop task failed: {0}")]
    Join(String),
}

/// One face instance to export.
#[derive(Debug, Clone)]
pub struct CropRequest {
    pub locator: FaceLocator,
    pub media: MediaRef,
    pub face: FaceBox,
}

#[async_trait]
pub trait ThumbnailExporter: Send + Sync {
    /// Render the crop, overwriting any previous artifact. Returns its path.
    async fn export_crop(&self, request: &CropRequest) -> Result<PathBuf, ThumbnailError>;

    /// Remove the artifact for `locator`, if any.
    async fn delete_crop(&self, locator: &FaceLocator) -> Result<(), ThumbnailError>;
}

/// Pixel rectangle `(x, y, width, height)` covered by `face`, clamped to the image.
pub fn crop_pixels(face: &FaceBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let w = width as f32;
    let h = height as f32;
    let x0 = (face.left.clamp(0.0, 1.0) * w).floor() as u32;
    let y0 = (face.top.clamp(0.0, 1.0) * h).floor() as u32;
    let x1 = (face.right.clamp(0.0, 1.0) * w).ceil() as u32;
    let y1 = (face.bottom.clamp(0.0, 1.0) * h).ceil() as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

/// Crops faces out of the original images with the `image` crate.
pub struct ImageCropExporter {
    images_root: PathBuf,
    out_root: PathBuf,
    size: u32,
}

impl ImageCropExporter {
    pub fn new(images_root: impl Into<PathBuf>, out_root: impl Into<PathBuf>) -> Self {
        Self {
            images_root: images_root.into(),
            out_root: out_root.into(),
            size: DEFAULT_THUMBNAIL_SIZE,
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn artifact_path(&self, locator: &FaceLocator) -> PathBuf {
        // Standard base64 may contain '/'.
        let file = locator.section_key().replace('/', "_");
        self.out_root
            .join(locator.hash.as_str().replace(['/', '\\'], "_"))
            .join(format!("{file}.jpg"))
    }
}

fn render_crop(source: &Path, target: &Path, face: FaceBox, size: u32) -> Result<(), ThumbnailError> {
    let img = image::open(source)?;
    let (x, y, w, h) = crop_pixels(&face, img.width(), img.height()).ok_or(ThumbnailError::EmptyCrop(face))?;
    let crop = img.crop_imm(x, y, w, h).thumbnail(size, size);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ThumbnailError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    // JPEG has no alpha channel.
    DynamicImage::ImageRgb8(crop.to_rgb8()).save(target)?;
    Ok(())
}

#[async_trait]
impl ThumbnailExporter for ImageCropExporter {
    async fn export_crop(&self, request: &CropRequest) -> Result<PathBuf, ThumbnailError> {
        let source = media_path(&self.images_root, &request.media);
        let target = self.artifact_path(&request.locator);
        let face = request.face;
        let size = self.size;

        let out = target.clone();
        tokio::task::spawn_blocking(move || render_crop(&source, &out, face, size))
            .await
            .map_err(|e| ThumbnailError::Join(e.to_string()))??;

        tracing::debug!(media = %request.media, path = %target.display(), "face crop exported");
        Ok(target)
    }

    async fn delete_crop(&self, locator: &FaceLocator) -> Result<(), ThumbnailError> {
        let path = self.artifact_path(locator);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ThumbnailError::Io { path, source }),
        }
    }
}
