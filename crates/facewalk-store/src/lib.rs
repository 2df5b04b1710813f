//! facewalk-store — Persistence and external collaborators.
//!
//! Debounced per-entry and global feature caches, per-album key/value
//! metadata, album enumeration, and face crop export.

pub mod albums;
pub mod debounce;
pub mod feature_cache;
pub mod metadata;
pub mod paths;
pub mod reference_store;
pub mod thumbnail;

pub use albums::{AlbumError, AlbumSource, FsAlbumSource, MemoryAlbumSource};
pub use debounce::{DebouncedWriter, FileSink, FlushSink};
pub use feature_cache::FeatureCache;
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataError, MetadataStore, Section, Sections};
pub use reference_store::ReferenceStore;
pub use thumbnail::{CropRequest, ImageCropExporter, ThumbnailError, ThumbnailExporter};
