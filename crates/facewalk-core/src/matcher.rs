//! Nearest-reference identity matching.
//!
//! Every resolved identity keeps one reference feature. An unresolved face is
//! compared against all of them by Euclidean embedding distance; the nearest
//! reference wins when it is closer than the caller's threshold.

use crate::types::{Embedding, IdentityHash, ReferenceMap};

/// Threshold for the bulk join pass, which creates identities on a miss.
pub const STRICT_THRESHOLD: f32 = 0.1;

/// Threshold for derived-hash lookups against the stored reference set.
pub const LOOSE_THRESHOLD: f32 = 0.2;

/// One identity's comparison anchor.
#[derive(Debug, Clone)]
pub struct Reference {
    pub hash: IdentityHash,
    pub embedding: Embedding,
}

/// Closest reference to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct NearestMatch {
    pub hash: IdentityHash,
    pub distance: f32,
}

/// What to do with an unresolved feature.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// No references exist yet.
    ColdStart,
    /// Nearest reference is under the threshold.
    Accept(NearestMatch),
    /// References exist but none is close enough.
    Reject(Option<NearestMatch>),
}

/// Strategy for finding the nearest reference in a gallery.
pub trait Matcher {
    fn nearest(&self, probe: &Embedding, gallery: &[Reference]) -> Option<NearestMatch>;
}

/// Euclidean-distance matcher.
///
/// References whose dimension differs from the probe are skipped. On equal
/// distances the earlier gallery entry wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn nearest(&self, probe: &Embedding, gallery: &[Reference]) -> Option<NearestMatch> {
        let mut best: Option<(usize, f32)> = None;

        for (i, reference) in gallery.iter().enumerate() {
            if reference.embedding.dim() != probe.dim() {
                tracing::debug!(
                    hash = %reference.hash,
                    expected = probe.dim(),
                    got = reference.embedding.dim(),
                    "skipping reference with mismatched embedding length"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&reference.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        best.map(|(idx, distance)| NearestMatch {
            hash: gallery[idx].hash.clone(),
            distance,
        })
    }
}

/// Snapshot of the reference set, ordered by identity hash.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    gallery: Vec<Reference>,
}

impl ReferenceIndex {
    pub fn build(references: &ReferenceMap) -> Self {
        let gallery = references
            .iter()
            .map(|(hash, feature)| Reference {
                hash: hash.clone(),
                embedding: feature.embedding.clone(),
            })
            .collect();
        Self { gallery }
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    /// Decide against this snapshot; a match must be strictly under `threshold`.
    pub fn decide<M: Matcher>(&self, matcher: &M, probe: &Embedding, threshold: f32) -> MatchDecision {
        if self.gallery.is_empty() {
            return MatchDecision::ColdStart;
        }
        match matcher.nearest(probe, &self.gallery) {
            Some(m) if m.distance < threshold => MatchDecision::Accept(m),
            other => MatchDecision::Reject(other),
        }
    }
}

/// Lazily built [`ReferenceIndex`] over a [`ReferenceMap`].
///
/// The index is rebuilt from the full map on the first query after
/// [`invalidate`](Self::invalidate). Owners must invalidate after every
/// change to the map.
pub struct IdentityMatcher<M: Matcher = EuclideanMatcher> {
    matcher: M,
    index: Option<ReferenceIndex>,
    rebuilds: usize,
}

impl IdentityMatcher<EuclideanMatcher> {
    pub fn new() -> Self {
        Self::with_matcher(EuclideanMatcher)
    }
}

impl Default for IdentityMatcher<EuclideanMatcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Matcher> IdentityMatcher<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self {
            matcher,
            index: None,
            rebuilds: 0,
        }
    }

    pub fn invalidate(&mut self) {
        self.index = None;
    }

    #[cfg(test)]
    pub fn is_built(&self) -> bool {
        self.index.is_some()
    }

    /// Number of times the index has been rebuilt.
    #[cfg(test)]
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn decide(&mut self, references: &ReferenceMap, probe: &Embedding, threshold: f32) -> MatchDecision {
        if self.index.is_none() {
            self.index = Some(ReferenceIndex::build(references));
            self.rebuilds += 1;
            tracing::debug!(references = references.len(), rebuilds = self.rebuilds, "reference index rebuilt");
        }
        match &self.index {
            Some(index) => index.decide(&self.matcher, probe, threshold),
            None => MatchDecision::ColdStart,
        }
    }
}
