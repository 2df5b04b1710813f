//! `rect64` face-list codec.
//!
//! Explicit face tags are stored per entry as
//! `rect64(<hex>),<hash>;rect64(<hex>),<hash>`. The 64-bit value packs
//! left, top, right and bottom (most significant first) as 16-bit
//! fractions of 65535. Writers may drop leading zeros.

use crate::types::{FaceBox, IdentityHash};
use thiserror::Error;

const RECT64_PREFIX: &str = "rect64(";
const RECT64_SCALE: f32 = 65535.0;

#[derive(Error, Debug, PartialEq)]
pub enum RectError {
    #[error("not a rect64 value: {0}")]
    Malformed(String),
    #[error("invalid rect64 hex digits: {0}")]
    InvalidHex(String),
}

/// One explicitly tagged face in an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitFace {
    pub hash: IdentityHash,
    pub rect: FaceBox,
}

fn to_fraction(value: f32) -> u64 {
    (value.clamp(0.0, 1.0) * RECT64_SCALE).round() as u64
}

pub fn encode_rect(rect: &FaceBox) -> String {
    let packed = (to_fraction(rect.left) << 48)
        | (to_fraction(rect.top) << 32)
        | (to_fraction(rect.right) << 16)
        | to_fraction(rect.bottom);
    format!("{RECT64_PREFIX}{packed:x})")
}

pub fn decode_rect(value: &str) -> Result<FaceBox, RectError> {
    let hex = value
        .trim()
        .strip_prefix(RECT64_PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| RectError::Malformed(value.to_string()))?;
    if hex.is_empty() || hex.len() > 16 {
        return Err(RectError::InvalidHex(hex.to_string()));
    }
    let packed = u64::from_str_radix(hex, 16).map_err(|_| RectError::InvalidHex(hex.to_string()))?;
    let part = |shift: u32| ((packed >> shift) & 0xffff) as f32 / RECT64_SCALE;
    Ok(FaceBox {
        left: part(48),
        top: part(32),
        right: part(16),
        bottom: part(0),
    })
}

/// Parse a `faces` field. Malformed items are skipped.
pub fn decode_faces(field: &str) -> Vec<ExplicitFace> {
    field
        .split(';')
        .filter(|item| !item.trim().is_empty())
        .filter_map(|item| {
            let (rect, hash) = item.split_once(',')?;
            match decode_rect(rect) {
                Ok(rect) => Some(ExplicitFace {
                    hash: IdentityHash::new(hash.trim()),
                    rect,
                }),
                Err(e) => {
                    tracing::debug!(item, error = %e, "skipping malformed face tag");
                    None
                }
            }
        })
        .collect()
}

pub fn encode_faces(faces: &[ExplicitFace]) -> String {
    faces
        .iter()
        .map(|f| format!("{},{}", encode_rect(&f.rect), f.hash))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_value() {
        let rect = decode_rect("rect64(5a6b0000c28ab778)").unwrap();
        assert!((rect.left - 0x5a6b as f32 / 65535.0).abs() < 1e-6);
        assert_eq!(rect.top, 0.0);
        assert!((rect.right - 0xc28a as f32 / 65535.0).abs() < 1e-6);
        assert!((rect.bottom - 0xb778 as f32 / 65535.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_hex_is_left_padded() {
        // Leading zero nibbles dropped: left = 0.
        let rect = decode_rect("rect64(ffff0000ffff)").unwrap();
        assert_eq!(rect.left, 0.0);
        assert_eq!(rect.top, 1.0);
        assert_eq!(rect.right, 0.0);
        assert_eq!(rect.bottom, 1.0);
    }

    #[test]
    fn test_encode_matches_stored_form() {
        let stored = "rect64(9bff22f6ad443ebb)";
        assert_eq!(encode_rect(&decode_rect(stored).unwrap()), stored);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_rect("rect(12)"), Err(RectError::Malformed(_))));
        assert!(matches!(decode_rect("rect64(zz)"), Err(RectError::InvalidHex(_))));
        assert!(matches!(decode_rect("rect64(11112222333344445)"), Err(RectError::InvalidHex(_))));
    }

    #[test]
    fn test_decode_face_list() {
        let field = "rect64(9bff22f6ad443ebb),d04ca592f8868c2;garbage;rect64(570c6e79670c8820),4f3f1b40e69b2537;";
        let faces = decode_faces(field);
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].hash.as_str(), "d04ca592f8868c2");
        assert_eq!(faces[1].hash.as_str(), "4f3f1b40e69b2537");
        assert_eq!(
            encode_faces(&faces),
            "rect64(9bff22f6ad443ebb),d04ca592f8868c2;rect64(570c6e79670c8820),4f3f1b40e69b2537"
        );
    }

    #[test]
    fn test_empty_field() {
        assert!(decode_faces("").is_empty());
        assert_eq!(encode_faces(&[]), "");
    }
}
