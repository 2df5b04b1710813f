//! facewalk-core — Face identity resolution primitives.
//!
//! Holds the feature records produced by an external face detector and the
//! two resolution strategies applied to them: geometric correlation against
//! explicitly tagged rectangles, then nearest-reference embedding matching.
//! Nothing in this crate performs I/O.

pub mod correlator;
pub mod locator;
pub mod matcher;
pub mod rect;
pub mod types;

pub use correlator::{correlate, Correlation};
pub use locator::{FaceLocator, LocatorError};
pub use matcher::{
    EuclideanMatcher, IdentityMatcher, MatchDecision, Matcher, NearestMatch, ReferenceIndex,
    LOOSE_THRESHOLD, STRICT_THRESHOLD,
};
pub use rect::{ExplicitFace, RectError};
pub use types::{
    normalize_name, Album, AlbumKind, Contact, Detection, Embedding, FaceAlbum, FaceBox,
    FeatureRecord, IdentityHash, MediaRef, PixelBox, ReferenceMap,
};
