use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of identity hashes minted by the matcher (as opposed to imported contacts).
const GENERATED_HASH_PREFIX: &str = "facehash:";

/// Extensions the detector is run on.
const PICTURE_EXTENSIONS: [&str; 9] = ["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff", "heic", "gif"];

/// Canonical reference feature per identity.
pub type ReferenceMap = BTreeMap<IdentityHash, FeatureRecord>;

/// Stable identifier of one resolved person.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh `facehash:<uuid>` identity.
    pub fn generate() -> Self {
        Self(format!("{GENERATED_HASH_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// True for hashes minted by [`generate`](Self::generate).
    pub fn is_generated(&self) -> bool {
        self.0.starts_with(GENERATED_HASH_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Face rectangle in normalized image coordinates (0..1 on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Center point as `(x, y)`.
    pub fn center(&self) -> (f32, f32) {
        (
            self.left + self.width() / 2.0,
            self.top + self.height() / 2.0,
        )
    }

    /// Strict containment: points on the border are outside.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.left < x && self.right > x && self.top < y && self.bottom > y
    }
}

/// Box in pixel coordinates, as reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelBox {
    /// Convert to a [`FaceBox`] relative to the image dimensions.
    pub fn normalize(&self, image_width: u32, image_height: u32) -> FaceBox {
        let w = image_width.max(1) as f32;
        let h = image_height.max(1) as f32;
        FaceBox {
            top: self.y / h,
            left: self.x / w,
            right: (self.x + self.width) / w,
            bottom: (self.y + self.height) / h,
        }
    }
}

/// Face embedding vector. Length is fixed by the detector model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face as returned by the external detector, in pixel space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub image_width: u32,
    pub image_height: u32,
    #[serde(rename = "box")]
    pub bbox: PixelBox,
    pub aligned_box: PixelBox,
    #[serde(default)]
    pub score: f32,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub gender_probability: Option<f32>,
    #[serde(default)]
    pub expressions: BTreeMap<String, f32>,
}

impl Detection {
    /// Normalize into an unresolved [`FeatureRecord`].
    pub fn into_feature(self) -> FeatureRecord {
        FeatureRecord {
            face_box: self.bbox.normalize(self.image_width, self.image_height),
            aligned_box: self.aligned_box.normalize(self.image_width, self.image_height),
            score: self.score,
            embedding: Embedding::new(self.embedding),
            age: self.age,
            gender: self.gender,
            gender_probability: self.gender_probability,
            expressions: self.expressions,
            hash: None,
        }
    }
}

/// One detected face in one image, as persisted in the per-entry cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub face_box: FaceBox,
    pub aligned_box: FaceBox,
    #[serde(default)]
    pub score: f32,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender_probability: Option<f32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expressions: BTreeMap<String, f32>,
    /// Identity this face resolved to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<IdentityHash>,
}

impl FeatureRecord {
    pub fn is_resolved(&self) -> bool {
        self.hash.is_some()
    }

    /// Point used for geometric correlation: center of the aligned box.
    pub fn center(&self) -> (f32, f32) {
        self.aligned_box.center()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlbumKind {
    Folder,
    Face,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Album {
    /// Stable path-like identifier (`2021/holidays` for folders, `face:<name>` for faces).
    pub key: String,
    pub name: String,
    pub kind: AlbumKind,
}

impl Album {
    pub fn folder(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: AlbumKind::Folder,
        }
    }

    pub fn face(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind: AlbumKind::Face,
        }
    }
}

/// One media file in one album.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaRef {
    pub album: Album,
    pub name: String,
}

impl MediaRef {
    pub fn new(album: Album, name: impl Into<String>) -> Self {
        Self {
            album,
            name: name.into(),
        }
    }

    fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    pub fn is_picture(&self) -> bool {
        self.extension()
            .is_some_and(|ext| PICTURE_EXTENSIONS.contains(&ext.as_str()))
    }

    pub fn is_animated(&self) -> bool {
        self.extension().is_some_and(|ext| ext == "gif")
    }

    /// Whether the detector should run on this entry.
    pub fn is_detectable(&self) -> bool {
        self.is_picture() && !self.is_animated()
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.album.key, self.name)
    }
}

/// Human-facing metadata attached to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub original_name: String,
    pub email: String,
    pub note: String,
}

impl Contact {
    pub fn named(original_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            email: String::new(),
            note: String::new(),
        }
    }

    /// Parse the `name;email;note` form stored in album contact sections.
    pub fn parse(value: &str) -> Self {
        let mut parts = value.splitn(3, ';');
        Self {
            original_name: parts.next().unwrap_or_default().to_string(),
            email: parts.next().unwrap_or_default().to_string(),
            note: parts.next().unwrap_or_default().to_string(),
        }
    }

    pub fn encode(&self) -> String {
        [
            self.original_name.as_str(),
            self.email.as_str(),
            self.note.as_str(),
        ]
        .join(";")
    }

    pub fn display_name(&self) -> String {
        normalize_name(&self.original_name)
    }

    /// Key of the face album surfacing this contact.
    pub fn album_key(&self) -> String {
        format!("face:{}", self.display_name())
    }
}

/// Lower-case the name, then upper-case the first letter of each word.
///
/// Words are separated by whitespace, `|` or `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_boundary = true;
    for c in name.to_lowercase().chars() {
        if at_boundary && c.is_ascii_alphabetic() {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        at_boundary = c.is_whitespace() || c == '|' || c == '-';
    }
    out
}

/// Virtual album surfacing every instance of one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAlbum {
    pub key: String,
    pub name: String,
    /// Identity hashes that resolve to this album.
    pub hashes: Vec<IdentityHash>,
    /// Face instances seen during the current pass.
    pub count: usize,
}

impl FaceAlbum {
    pub fn album(&self) -> Album {
        Album::face(self.key.clone(), self.name.clone())
    }
}
