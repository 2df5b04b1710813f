//! Composite keys naming one face instance inside a face album.
//!
//! A key is the standard base64 encoding of the JSON array
//! `[albumKey, entryName, faceHash]`.

use crate::types::IdentityHash;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("face key is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("face key is not a [album, entry, hash] triple: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a face instance came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FaceLocator {
    pub album_key: String,
    pub entry_name: String,
    pub hash: IdentityHash,
}

impl FaceLocator {
    pub fn new(album_key: impl Into<String>, entry_name: impl Into<String>, hash: IdentityHash) -> Self {
        Self {
            album_key: album_key.into(),
            entry_name: entry_name.into(),
            hash,
        }
    }

    pub fn section_key(&self) -> String {
        let triple = (&self.album_key, &self.entry_name, self.hash.as_str());
        // Serializing a tuple of strings cannot fail.
        let json = serde_json::to_string(&triple).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn from_section_key(key: &str) -> Result<Self, LocatorError> {
        let bytes = STANDARD.decode(key)?;
        let (album_key, entry_name, hash): (String, String, String) = serde_json::from_slice(&bytes)?;
        Ok(Self {
            album_key,
            entry_name,
            hash: IdentityHash::new(hash),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_key_is_base64_json_triple() {
        let loc = FaceLocator::new("2021/trip", "IMG_1.jpg", IdentityHash::from("facehash:x"));
        let key = loc.section_key();
        let json = String::from_utf8(STANDARD.decode(&key).unwrap()).unwrap();
        assert_eq!(json, r#"["2021/trip","IMG_1.jpg","facehash:x"]"#);
        assert_eq!(FaceLocator::from_section_key(&key).unwrap(), loc);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(FaceLocator::from_section_key("%%%"), Err(LocatorError::Base64(_))));
        let not_triple = STANDARD.encode(r#"{"a":1}"#);
        assert!(matches!(FaceLocator::from_section_key(&not_triple), Err(LocatorError::Json(_))));
    }
}
