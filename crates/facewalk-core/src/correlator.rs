//! Geometric correlation of detected faces with explicit face tags.

use crate::rect::ExplicitFace;
use crate::types::{FeatureRecord, IdentityHash};

/// A hash assigned to a feature by rectangle containment.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    /// Index into the feature slice.
    pub feature: usize,
    /// Index of the winning explicit face.
    pub rect: usize,
    pub hash: IdentityHash,
}

/// First explicit face, in stored order, whose rectangle contains the feature's center.
pub fn find_rect(feature: &FeatureRecord, explicit: &[ExplicitFace]) -> Option<usize> {
    let (x, y) = feature.center();
    explicit.iter().position(|face| face.rect.contains(x, y))
}

/// Assign hashes to unresolved features from explicit face tags.
///
/// Features that already carry a hash are left untouched. First match wins;
/// there is no distance scoring between overlapping rectangles.
pub fn correlate(features: &mut [FeatureRecord], explicit: &[ExplicitFace]) -> Vec<Correlation> {
    let mut assigned = Vec::new();
    if explicit.is_empty() {
        return assigned;
    }

    for (i, feature) in features.iter_mut().enumerate() {
        if feature.is_resolved() {
            continue;
        }
        if let Some(rect) = find_rect(feature, explicit) {
            let hash = explicit[rect].hash.clone();
            feature.hash = Some(hash.clone());
            assigned.push(Correlation {
                feature: i,
                rect,
                hash,
            });
        }
    }

    assigned
}
