//! Write-serialized owner of identity state.
//!
//! The identity registry, the reference feature store and the matcher index
//! derived from it change together. All resolution goes through one
//! [`Resolver`], which the orchestrator keeps behind a mutex.

use crate::registry::{IdentityRegistry, RegistryError};
use facewalk_core::rect::{decode_faces, decode_rect, encode_faces, encode_rect};
use facewalk_core::{
    correlate, Album, Contact, ExplicitFace, FaceBox, FaceLocator, FeatureRecord, IdentityHash,
    IdentityMatcher, LocatorError, MatchDecision, MediaRef, LOOSE_THRESHOLD, STRICT_THRESHOLD,
};
use facewalk_store::{AlbumError, AlbumSource, CropRequest, FeatureCache, MetadataError, MetadataStore, ReferenceStore, Sections};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Per-album section mapping identity hash to `name;email;note`.
pub const CONTACTS_SECTION: &str = "Contacts2";
/// Per-entry field holding the explicit face list.
pub const FACES_FIELD: &str = "faces";

const ORIGINAL_ALBUM_KEY: &str = "originalAlbumKey";
const ORIGINAL_ALBUM_NAME: &str = "originalAlbumName";
const ORIGINAL_NAME: &str = "originalName";
const RECT_FIELD: &str = "rect";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Album(#[from] AlbumError),
    #[error("invalid face key: {0}")]
    Locator(#[from] LocatorError),
    #[error("feature is already resolved to {0}")]
    AlreadyResolved(IdentityHash),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Join pass; a miss creates a new identity.
    pub strict: f32,
    /// Derived-hash pass; a miss leaves the feature for the join pass.
    pub loose: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            strict: STRICT_THRESHOLD,
            loose: LOOSE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Reused { hash: IdentityHash, distance: f32 },
    Created(IdentityHash),
}

impl Resolution {
    pub fn hash(&self) -> &IdentityHash {
        match self {
            Self::Reused { hash, .. } | Self::Created(hash) => hash,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeometricOutcome {
    /// Features assigned by rectangle containment.
    pub correlated: usize,
    /// Features assigned from the reference store at the loose threshold.
    pub derived: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Face instances counted towards their face album.
    pub counted: usize,
    /// Face instances whose original entry no longer exists.
    pub orphaned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub features_rewritten: usize,
    pub entries_rewritten: usize,
}

/// Contacts listed in one album's metadata.
pub async fn read_album_contacts(
    metadata: &dyn MetadataStore,
    album: &Album,
) -> Result<Vec<(IdentityHash, Contact)>, MetadataError> {
    let sections = metadata.read_all(album).await?;
    Ok(sections
        .get(CONTACTS_SECTION)
        .map(|contacts| {
            contacts
                .iter()
                .map(|(hash, value)| (IdentityHash::new(hash.as_str()), Contact::parse(value)))
                .collect()
        })
        .unwrap_or_default())
}

fn leaf_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

pub struct Resolver {
    registry: IdentityRegistry,
    references: ReferenceStore,
    matcher: IdentityMatcher,
    features: FeatureCache,
    metadata: Arc<dyn MetadataStore>,
    thresholds: Thresholds,
}

impl Resolver {
    pub fn new(
        registry: IdentityRegistry,
        references: ReferenceStore,
        features: FeatureCache,
        metadata: Arc<dyn MetadataStore>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            registry,
            references,
            matcher: IdentityMatcher::new(),
            features,
            metadata,
            thresholds,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn references(&self) -> &ReferenceStore {
        &self.references
    }

    /// Start a scan pass: counts are recomputed from scratch by reconciliation.
    pub fn begin_pass(&mut self) {
        self.registry.reset_counts();
    }

    pub fn import_contacts(&mut self, contacts: Vec<(IdentityHash, Contact)>) -> usize {
        let n = contacts.len();
        for (hash, contact) in contacts {
            self.registry.import_contact(hash, contact);
        }
        n
    }

    async fn read_faces(&self, media: &MediaRef) -> Result<Vec<ExplicitFace>, MetadataError> {
        Ok(self
            .metadata
            .read_field(&media.album, &media.name, FACES_FIELD)
            .await?
            .map(|field| decode_faces(&field))
            .unwrap_or_default())
    }

    async fn write_faces(&self, media: &MediaRef, faces: &[ExplicitFace]) -> Result<(), MetadataError> {
        let value = (!faces.is_empty()).then(|| encode_faces(faces));
        self.metadata
            .write_field(&media.album, &media.name, FACES_FIELD, value.as_deref())
            .await
    }

    /// Append a face tag to the entry unless an identical one is already listed.
    async fn add_face_rect(&self, media: &MediaRef, rect: &FaceBox, hash: &IdentityHash) -> Result<(), MetadataError> {
        let mut faces = self.read_faces(media).await?;
        let encoded = encode_rect(rect);
        if faces
            .iter()
            .any(|f| &f.hash == hash && encode_rect(&f.rect) == encoded)
        {
            return Ok(());
        }
        faces.push(ExplicitFace {
            hash: hash.clone(),
            rect: *rect,
        });
        self.write_faces(media, &faces).await
    }

    /// Record the identity's contact in the album. Hashes without a contact are skipped.
    async fn add_contact(&self, album: &Album, hash: &IdentityHash) -> Result<(), MetadataError> {
        let Some(contact) = self.registry.contact_for(hash) else {
            tracing::debug!(hash = %hash, "no contact for identity; skipping contact sync");
            return Ok(());
        };
        self.metadata
            .write_field(album, CONTACTS_SECTION, hash.as_str(), Some(&contact.encode()))
            .await
    }

    async fn clear_back_reference(&self, face_album: &Album, section: &str) -> Result<(), MetadataError> {
        for field in [ORIGINAL_ALBUM_KEY, ORIGINAL_ALBUM_NAME, ORIGINAL_NAME, RECT_FIELD] {
            self.metadata.write_field(face_album, section, field, None).await?;
        }
        Ok(())
    }

    /// Write only the fields whose stored value differs.
    async fn sync_section(
        &self,
        album: &Album,
        current: &Sections,
        section: &str,
        fields: [(&str, Option<&str>); 4],
    ) -> Result<(), MetadataError> {
        let existing = current.get(section);
        for (field, value) in fields {
            let stored = existing.and_then(|s| s.get(field)).map(String::as_str);
            if stored != value {
                self.metadata.write_field(album, section, field, value).await?;
            }
        }
        Ok(())
    }

    /// Geometric pass for one entry.
    ///
    /// Features are first correlated with the entry's explicit face tags;
    /// explicitly tagged identities without a reference get this feature as
    /// theirs. Remaining features adopt the nearest reference under the loose
    /// threshold.
    pub async fn correlate_entry(
        &mut self,
        media: &MediaRef,
        features: &mut [FeatureRecord],
    ) -> Result<GeometricOutcome, ResolveError> {
        let explicit = self.read_faces(media).await?;
        let correlations = correlate(features, &explicit);
        for c in &correlations {
            tracing::debug!(media = %media, hash = %c.hash, "face matched explicit rectangle");
            if !self.references.contains(&c.hash) {
                self.references.insert(c.hash.clone(), features[c.feature].clone());
                self.matcher.invalidate();
            }
        }

        let mut derived = 0;
        for feature in features.iter_mut().filter(|f| !f.is_resolved()) {
            let decision = self
                .matcher
                .decide(self.references.get(), &feature.embedding, self.thresholds.loose);
            if let MatchDecision::Accept(m) = decision {
                tracing::debug!(media = %media, hash = %m.hash, distance = m.distance, "derived hash from reference features");
                feature.hash = Some(m.hash.clone());
                self.add_face_rect(media, &feature.aligned_box, &m.hash).await?;
                self.add_contact(&media.album, &m.hash).await?;
                derived += 1;
            }
        }

        if !correlations.is_empty() || derived > 0 {
            self.features.write(media, features);
        }
        Ok(GeometricOutcome {
            correlated: correlations.len(),
            derived,
        })
    }

    /// Join pass for one feature: reuse the nearest identity under the strict
    /// threshold, otherwise mint a new identity seeded with this feature.
    pub async fn resolve(&mut self, media: &MediaRef, feature: &mut FeatureRecord) -> Result<Resolution, ResolveError> {
        if let Some(hash) = &feature.hash {
            return Err(ResolveError::AlreadyResolved(hash.clone()));
        }

        let decision = self
            .matcher
            .decide(self.references.get(), &feature.embedding, self.thresholds.strict);
        let resolution = match decision {
            MatchDecision::Accept(m) => {
                feature.hash = Some(m.hash.clone());
                let better = self
                    .references
                    .get_feature(&m.hash)
                    .map_or(true, |current| feature.score > current.score);
                if better {
                    self.references.insert(m.hash.clone(), feature.clone());
                    self.matcher.invalidate();
                }
                tracing::debug!(media = %media, hash = %m.hash, distance = m.distance, "reusing identity");
                Resolution::Reused {
                    hash: m.hash,
                    distance: m.distance,
                }
            }
            MatchDecision::ColdStart | MatchDecision::Reject(_) => {
                let hash = self.registry.create_identity(None);
                feature.hash = Some(hash.clone());
                self.references.insert(hash.clone(), feature.clone());
                self.matcher.invalidate();
                Resolution::Created(hash)
            }
        };

        let hash = resolution.hash().clone();
        self.add_face_rect(media, &feature.aligned_box, &hash).await?;
        self.add_contact(&media.album, &hash).await?;
        Ok(resolution)
    }

    /// Join pass for every unresolved feature of one entry.
    pub async fn resolve_entry(
        &mut self,
        media: &MediaRef,
        features: &mut [FeatureRecord],
    ) -> Result<Vec<Resolution>, ResolveError> {
        let mut resolutions = Vec::new();
        for feature in features.iter_mut().filter(|f| !f.is_resolved()) {
            resolutions.push(self.resolve(media, feature).await?);
        }
        if !resolutions.is_empty() {
            self.features.write(media, features);
        }
        Ok(resolutions)
    }

    /// Count every tagged face of a folder album and sync its cross-references.
    ///
    /// Each face puts its contact into the album's contact section and a
    /// back-reference into its face album. Back-references of entries that no
    /// longer exist are cleared and not counted.
    pub async fn reconcile_album(
        &mut self,
        album: &Album,
        source: &dyn AlbumSource,
    ) -> Result<ReconcileOutcome, ResolveError> {
        let sections = self.metadata.read_all(album).await?;
        let mut contacts: HashSet<String> = sections
            .get(CONTACTS_SECTION)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        let mut face_albums: HashMap<String, Sections> = HashMap::new();
        let mut outcome = ReconcileOutcome::default();

        for (entry, section) in &sections {
            if entry == CONTACTS_SECTION {
                continue;
            }
            let Some(field) = section.get(FACES_FIELD) else {
                continue;
            };
            let media = MediaRef::new(album.clone(), entry.as_str());
            let exists = source.exists(&media).await;

            for face in decode_faces(field) {
                let Some(face_album) = self.registry.by_hash(&face.hash).map(|a| a.album()) else {
                    tracing::debug!(media = %media, hash = %face.hash, "face tag without identity; skipping");
                    continue;
                };

                if !contacts.contains(face.hash.as_str()) {
                    self.add_contact(album, &face.hash).await?;
                    contacts.insert(face.hash.as_str().to_string());
                }

                if !face_albums.contains_key(&face_album.key) {
                    let current = self.metadata.read_all(&face_album).await?;
                    face_albums.insert(face_album.key.clone(), current);
                }
                let current = &face_albums[&face_album.key];
                let section_key = FaceLocator::new(album.key.as_str(), entry.as_str(), face.hash.clone()).section_key();

                if exists {
                    self.registry.record_face(&face.hash, &media);
                    let rect = encode_rect(&face.rect);
                    self.sync_section(
                        &face_album,
                        current,
                        &section_key,
                        [
                            (ORIGINAL_ALBUM_KEY, Some(album.key.as_str())),
                            (ORIGINAL_ALBUM_NAME, Some(album.name.as_str())),
                            (ORIGINAL_NAME, Some(entry.as_str())),
                            (RECT_FIELD, Some(rect.as_str())),
                        ],
                    )
                    .await?;
                    outcome.counted += 1;
                } else {
                    tracing::debug!(media = %media, hash = %face.hash, "original entry missing; clearing back-reference");
                    self.sync_section(
                        &face_album,
                        current,
                        &section_key,
                        [
                            (ORIGINAL_ALBUM_KEY, None),
                            (ORIGINAL_ALBUM_NAME, None),
                            (ORIGINAL_NAME, None),
                            (RECT_FIELD, None),
                        ],
                    )
                    .await?;
                    outcome.orphaned += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// One crop request per live back-reference of every face album.
    pub async fn export_requests(&self) -> Result<Vec<CropRequest>, MetadataError> {
        let mut requests = Vec::new();
        for face_album in self.registry.get_all() {
            let sections = self.metadata.read_all(&face_album.album()).await?;
            for (key, section) in sections {
                let (Some(album_key), Some(name), Some(rect)) = (
                    section.get(ORIGINAL_ALBUM_KEY),
                    section.get(ORIGINAL_NAME),
                    section.get(RECT_FIELD),
                ) else {
                    tracing::debug!(album = %face_album.key, section = %key, "orphaned face; not exported");
                    continue;
                };
                let (locator, face) = match (FaceLocator::from_section_key(&key), decode_rect(rect)) {
                    (Ok(locator), Ok(face)) => (locator, face),
                    _ => {
                        tracing::debug!(album = %face_album.key, section = %key, "unreadable back-reference");
                        continue;
                    }
                };
                let album_name = section
                    .get(ORIGINAL_ALBUM_NAME)
                    .cloned()
                    .unwrap_or_else(|| leaf_name(album_key));
                requests.push(CropRequest {
                    locator,
                    media: MediaRef::new(Album::folder(album_key.as_str(), album_name), name.as_str()),
                    face,
                });
            }
        }
        Ok(requests)
    }

    /// Fold `source` into `target` across caches and metadata.
    ///
    /// Every album listed by `albums` is searched, so the rewrite does not
    /// depend on what the current pass has reconciled so far. Already
    /// exported crops are left alone.
    pub async fn merge(
        &mut self,
        target: &IdentityHash,
        source: &IdentityHash,
        albums: &dyn AlbumSource,
    ) -> Result<MergeReport, ResolveError> {
        let outcome = self.registry.merge(target, source)?;
        let target_contact = self.registry.contact_for(target).cloned();
        let mut report = MergeReport::default();

        for album in albums.list_albums().await? {
            let sections = self.metadata.read_all(&album).await?;
            let mut seen_in_album = sections
                .get(CONTACTS_SECTION)
                .is_some_and(|contacts| contacts.contains_key(source.as_str()));

            for (entry, section) in &sections {
                if entry == CONTACTS_SECTION {
                    continue;
                }
                let Some(field) = section.get(FACES_FIELD) else {
                    continue;
                };
                let mut faces = decode_faces(field);
                let mut changed = false;
                for face in faces.iter_mut().filter(|f| &f.hash == source) {
                    face.hash = target.clone();
                    changed = true;
                }
                if changed {
                    let media = MediaRef::new(album.clone(), entry.as_str());
                    self.write_faces(&media, &faces).await?;
                    report.entries_rewritten += 1;
                    seen_in_album = true;
                }
            }

            for media in albums.read_entries(&album).await? {
                let Some(mut features) = self.features.read(&media).await else {
                    continue;
                };
                let mut changed = false;
                for f in features.iter_mut().filter(|f| f.hash.as_ref() == Some(source)) {
                    f.hash = Some(target.clone());
                    changed = true;
                    report.features_rewritten += 1;
                }
                if changed {
                    self.features.write(&media, &features);
                    seen_in_album = true;
                }
            }

            if seen_in_album {
                self.metadata
                    .write_field(&album, CONTACTS_SECTION, source.as_str(), None)
                    .await?;
                if let Some(contact) = &target_contact {
                    self.metadata
                        .write_field(&album, CONTACTS_SECTION, target.as_str(), Some(&contact.encode()))
                        .await?;
                }
            }
        }

        // Back-references are rewritten under the target by the next reconciliation.
        let source_album = outcome.source_album.album();
        let stale: Vec<String> = self
            .metadata
            .read_all(&source_album)
            .await?
            .into_keys()
            .filter(|key| FaceLocator::from_section_key(key).is_ok_and(|l| &l.hash == source))
            .collect();
        for key in &stale {
            self.clear_back_reference(&source_album, key).await?;
        }

        if let Some(mut reference) = self.references.remove(source) {
            if !self.references.contains(target) {
                reference.hash = Some(target.clone());
                self.references.insert(target.clone(), reference);
            }
        }
        self.matcher.invalidate();

        tracing::info!(
            target = %target,
            source = %source,
            features = report.features_rewritten,
            entries = report.entries_rewritten,
            counted = outcome.moved_faces,
            album_removed = outcome.source_album_removed,
            "merge written through"
        );
        Ok(report)
    }

    /// Remove one face instance from a face album and from its original entry.
    ///
    /// Returns the erased face's locator so the caller can drop its crop.
    pub async fn erase_face(&mut self, face_album_key: &str, section_key: &str) -> Result<FaceLocator, ResolveError> {
        let locator = FaceLocator::from_section_key(section_key)?;
        let face_album = self
            .registry
            .by_key(face_album_key)
            .map(|a| a.album())
            .ok_or_else(|| RegistryError::UnknownAlbum(face_album_key.to_string()))?;

        let album_name = self
            .metadata
            .read_field(&face_album, section_key, ORIGINAL_ALBUM_NAME)
            .await?
            .unwrap_or_else(|| leaf_name(&locator.album_key));
        self.clear_back_reference(&face_album, section_key).await?;

        let original = MediaRef::new(
            Album::folder(locator.album_key.as_str(), album_name),
            locator.entry_name.as_str(),
        );
        let faces = self.read_faces(&original).await?;
        let kept: Vec<ExplicitFace> = faces.iter().filter(|f| f.hash != locator.hash).cloned().collect();
        if kept.len() != faces.len() {
            self.write_faces(&original, &kept).await?;
        }

        tracing::info!(album = %face_album_key, media = %original, hash = %locator.hash, "face erased");
        Ok(locator)
    }

    /// Flush both debounced writers. Returns the number of files written.
    pub async fn flush(&self) -> usize {
        self.features.flush().await + self.references.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewalk_core::Embedding;
    use facewalk_store::{DebouncedWriter, FileSink, MemoryAlbumSource, MemoryMetadataStore};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        metadata: Arc<MemoryMetadataStore>,
        albums: MemoryAlbumSource,
        features: FeatureCache,
        resolver: Resolver,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let writer = || DebouncedWriter::spawn(Duration::from_secs(20), Arc::new(FileSink));
        let features = FeatureCache::new(dir.path().join("references"), writer());
        let references = ReferenceStore::load(dir.path().join("referenceFeatures.json"), writer()).await;
        let metadata = Arc::new(MemoryMetadataStore::new());
        let resolver = Resolver::new(
            IdentityRegistry::new(),
            references,
            features.clone(),
            metadata.clone(),
            Thresholds::default(),
        );
        Fixture {
            _dir: dir,
            metadata,
            albums: MemoryAlbumSource::new(),
            features,
            resolver,
        }
    }

    fn face(left: f32, embedding: Vec<f32>) -> FeatureRecord {
        let b = FaceBox { top: 0.2, left, right: left + 0.2, bottom: 0.4 };
        FeatureRecord {
            face_box: b,
            aligned_box: b,
            score: 0.9,
            embedding: Embedding::new(embedding),
            age: None,
            gender: None,
            gender_probability: None,
            expressions: BTreeMap::new(),
            hash: None,
        }
    }

    fn trip() -> Album {
        Album::folder("2021/trip", "trip")
    }

    #[tokio::test]
    async fn test_cold_start_creates_and_seeds_identity() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut features = vec![face(0.1, vec![0.0, 0.0])];

        let resolutions = fx.resolver.resolve_entry(&media, &mut features).await.unwrap();
        assert_eq!(resolutions.len(), 1);
        let Resolution::Created(hash) = &resolutions[0] else {
            panic!("expected a new identity, got {resolutions:?}");
        };

        assert_eq!(fx.resolver.registry().len(), 1);
        assert_eq!(fx.resolver.references().len(), 1);
        assert!(fx.resolver.references().contains(hash));
        assert_eq!(features[0].hash.as_ref(), Some(hash));
        assert_eq!(fx.features.read(&media).await.unwrap()[0].hash.as_ref(), Some(hash));

        let sections = fx.metadata.snapshot(&trip());
        let tags = decode_faces(&sections["1.jpg"][FACES_FIELD]);
        assert_eq!(tags.len(), 1);
        assert_eq!(&tags[0].hash, hash);
        assert!(sections[CONTACTS_SECTION][hash.as_str()].starts_with("Unknown person added on "));
    }

    #[tokio::test]
    async fn test_near_feature_reuses_identity_and_counts() {
        let mut fx = fixture().await;
        let first = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let second = fx.albums.add_entry(&trip(), "2.jpg", vec![]);

        let mut a = vec![face(0.1, vec![0.0, 0.0])];
        fx.resolver.resolve_entry(&first, &mut a).await.unwrap();
        fx.resolver.begin_pass();
        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        let hash = a[0].hash.clone().unwrap();
        assert_eq!(fx.resolver.registry().by_hash(&hash).unwrap().count, 1);

        let mut b = vec![face(0.5, vec![0.05, 0.0])];
        let resolutions = fx.resolver.resolve_entry(&second, &mut b).await.unwrap();
        match &resolutions[0] {
            Resolution::Reused { hash: reused, distance } => {
                assert_eq!(reused, &hash);
                assert!((distance - 0.05).abs() < 1e-6);
            }
            other => panic!("expected reuse, got {other:?}"),
        }

        fx.resolver.begin_pass();
        let outcome = fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        assert_eq!(outcome.counted, 2);
        assert_eq!(fx.resolver.registry().len(), 1);
        assert_eq!(fx.resolver.registry().by_hash(&hash).unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_far_feature_creates_second_identity() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut features = vec![face(0.1, vec![0.0, 0.0]), face(0.6, vec![0.5, 0.5])];
        let resolutions = fx.resolver.resolve_entry(&media, &mut features).await.unwrap();
        assert!(resolutions.iter().all(|r| matches!(r, Resolution::Created(_))));
        assert_eq!(fx.resolver.registry().len(), 2);
        assert_eq!(fx.resolver.references().len(), 2);
        assert_ne!(features[0].hash, features[1].hash);
    }

    #[tokio::test]
    async fn test_resolved_feature_is_never_rematched() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut feature = face(0.1, vec![0.0]);
        feature.hash = Some(IdentityHash::from("facehash:kept"));
        assert!(matches!(
            fx.resolver.resolve(&media, &mut feature).await,
            Err(ResolveError::AlreadyResolved(_))
        ));

        let mut features = vec![feature];
        assert!(fx.resolver.resolve_entry(&media, &mut features).await.unwrap().is_empty());
        assert_eq!(fx.resolver.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_geometric_pass_then_derived_hash() {
        let mut fx = fixture().await;
        let tagged = fx.albums.add_entry(&trip(), "tagged.jpg", vec![]);
        let untagged = fx.albums.add_entry(&trip(), "untagged.jpg", vec![]);
        let legacy = IdentityHash::from("legacy-hash");
        fx.resolver
            .import_contacts(vec![(legacy.clone(), Contact::parse("rosa parks;;"))]);
        let tag = ExplicitFace {
            hash: legacy.clone(),
            rect: FaceBox { top: 0.1, left: 0.0, right: 0.5, bottom: 0.5 },
        };
        fx.metadata
            .write_field(&trip(), "tagged.jpg", FACES_FIELD, Some(&encode_faces(&[tag])))
            .await
            .unwrap();

        let mut features = vec![face(0.1, vec![1.0, 1.0])];
        let outcome = fx.resolver.correlate_entry(&tagged, &mut features).await.unwrap();
        assert_eq!(outcome, GeometricOutcome { correlated: 1, derived: 0 });
        assert_eq!(features[0].hash.as_ref(), Some(&legacy));
        assert!(fx.resolver.references().contains(&legacy));

        // 0.15 away: under the loose threshold, over the strict one.
        let mut others = vec![face(0.6, vec![1.15, 1.0])];
        let outcome = fx.resolver.correlate_entry(&untagged, &mut others).await.unwrap();
        assert_eq!(outcome, GeometricOutcome { correlated: 0, derived: 1 });
        assert_eq!(others[0].hash.as_ref(), Some(&legacy));

        let sections = fx.metadata.snapshot(&trip());
        assert_eq!(decode_faces(&sections["untagged.jpg"][FACES_FIELD])[0].hash, legacy);
        assert_eq!(sections[CONTACTS_SECTION][legacy.as_str()], "rosa parks;;");
        assert_eq!(fx.features.read(&untagged).await.unwrap()[0].hash.as_ref(), Some(&legacy));
    }

    #[tokio::test]
    async fn test_correlation_is_idempotent() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let hash = IdentityHash::from("h");
        let tag = ExplicitFace {
            hash: hash.clone(),
            rect: FaceBox { top: 0.0, left: 0.0, right: 1.0, bottom: 1.0 },
        };
        fx.metadata
            .write_field(&trip(), "1.jpg", FACES_FIELD, Some(&encode_faces(&[tag])))
            .await
            .unwrap();

        let mut once = vec![face(0.1, vec![0.0])];
        let mut twice = once.clone();
        fx.resolver.correlate_entry(&media, &mut once).await.unwrap();
        fx.resolver.correlate_entry(&media, &mut twice).await.unwrap();
        fx.resolver.correlate_entry(&media, &mut twice).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_back_references_follow_entry_existence() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut features = vec![face(0.1, vec![0.0, 0.0])];
        fx.resolver.resolve_entry(&media, &mut features).await.unwrap();
        let hash = features[0].hash.clone().unwrap();

        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        let face_album = fx.resolver.registry().by_hash(&hash).unwrap().album();
        let key = FaceLocator::new("2021/trip", "1.jpg", hash.clone()).section_key();
        let section = &fx.metadata.snapshot(&face_album)[&key];
        assert_eq!(section[ORIGINAL_ALBUM_KEY], "2021/trip");
        assert_eq!(section[ORIGINAL_ALBUM_NAME], "trip");
        assert_eq!(section[ORIGINAL_NAME], "1.jpg");

        let requests = fx.resolver.export_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].media, media);
        assert_eq!(requests[0].locator.hash, hash);

        fx.albums.remove_entry(&media);
        fx.resolver.begin_pass();
        let outcome = fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { counted: 0, orphaned: 1 });
        assert!(!fx.metadata.snapshot(&face_album).contains_key(&key));
        assert!(fx.resolver.export_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_rewrites_features_and_tags() {
        let mut fx = fixture().await;
        let a = fx.albums.add_entry(&trip(), "a.jpg", vec![]);
        let b = fx.albums.add_entry(&trip(), "b.jpg", vec![]);
        let mut fa = vec![face(0.1, vec![0.0, 0.0])];
        let mut fb = vec![face(0.1, vec![0.9, 0.9])];
        fx.resolver.resolve_entry(&a, &mut fa).await.unwrap();
        fx.resolver.resolve_entry(&b, &mut fb).await.unwrap();
        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        let target = fa[0].hash.clone().unwrap();
        let source = fb[0].hash.clone().unwrap();

        let report = fx.resolver.merge(&target, &source, &fx.albums).await.unwrap();
        assert_eq!(report, MergeReport { features_rewritten: 1, entries_rewritten: 1 });
        assert_eq!(fx.resolver.registry().len(), 1);
        assert_eq!(fx.features.read(&b).await.unwrap()[0].hash.as_ref(), Some(&target));

        let sections = fx.metadata.snapshot(&trip());
        assert_eq!(decode_faces(&sections["b.jpg"][FACES_FIELD])[0].hash, target);
        assert!(!sections[CONTACTS_SECTION].contains_key(source.as_str()));
        assert!(!fx.resolver.references().contains(&source));
        assert!(fx.resolver.references().contains(&target));

        fx.resolver.begin_pass();
        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        assert_eq!(fx.resolver.registry().by_hash(&target).unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_merge_after_counts_reset_still_rewrites_everything() {
        let mut fx = fixture().await;
        let a = fx.albums.add_entry(&trip(), "a.jpg", vec![]);
        let b = fx.albums.add_entry(&trip(), "b.jpg", vec![]);
        let mut fa = vec![face(0.1, vec![0.0, 0.0])];
        let mut fb = vec![face(0.1, vec![0.9, 0.9])];
        fx.resolver.resolve_entry(&a, &mut fa).await.unwrap();
        fx.resolver.resolve_entry(&b, &mut fb).await.unwrap();
        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        let target = fa[0].hash.clone().unwrap();
        let source = fb[0].hash.clone().unwrap();
        let source_album = fx.resolver.registry().by_hash(&source).unwrap().album();

        // A merge arriving mid-pass, before reconciliation has run again.
        fx.resolver.begin_pass();
        let report = fx.resolver.merge(&target, &source, &fx.albums).await.unwrap();
        assert_eq!(report, MergeReport { features_rewritten: 1, entries_rewritten: 1 });

        assert_eq!(fx.features.read(&b).await.unwrap()[0].hash.as_ref(), Some(&target));
        let sections = fx.metadata.snapshot(&trip());
        assert_eq!(decode_faces(&sections["b.jpg"][FACES_FIELD])[0].hash, target);
        assert!(!sections[CONTACTS_SECTION].contains_key(source.as_str()));
        assert!(sections[CONTACTS_SECTION].contains_key(target.as_str()));
        assert!(fx.metadata.snapshot(&source_album).is_empty());

        // A restart rebuilds the registry from the album contacts alone.
        let mut reloaded = IdentityRegistry::new();
        for (hash, contact) in read_album_contacts(fx.metadata.as_ref(), &trip()).await.unwrap() {
            reloaded.import_contact(hash, contact);
        }
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.by_hash(&source).is_none());
    }

    #[tokio::test]
    async fn test_created_identities_survive_restart() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut features = vec![face(0.1, vec![0.0, 0.0]), face(0.6, vec![0.5, 0.5])];
        fx.resolver.resolve_entry(&media, &mut features).await.unwrap();
        assert_eq!(fx.resolver.registry().len(), 2);

        let mut reloaded = IdentityRegistry::new();
        for (hash, contact) in read_album_contacts(fx.metadata.as_ref(), &trip()).await.unwrap() {
            reloaded.import_contact(hash, contact);
        }
        assert_eq!(reloaded.len(), 2);
        let first = reloaded.by_hash(features[0].hash.as_ref().unwrap()).unwrap();
        let second = reloaded.by_hash(features[1].hash.as_ref().unwrap()).unwrap();
        assert_ne!(first.key, second.key);
    }

    #[tokio::test]
    async fn test_merge_unknown_identity_is_error() {
        let mut fx = fixture().await;
        let err = fx
            .resolver
            .merge(&IdentityHash::from("x"), &IdentityHash::from("y"), &fx.albums)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Registry(RegistryError::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn test_erase_face_drops_tag_and_back_reference() {
        let mut fx = fixture().await;
        let media = fx.albums.add_entry(&trip(), "1.jpg", vec![]);
        let mut features = vec![face(0.1, vec![0.0, 0.0])];
        fx.resolver.resolve_entry(&media, &mut features).await.unwrap();
        fx.resolver.reconcile_album(&trip(), &fx.albums).await.unwrap();
        let hash = features[0].hash.clone().unwrap();
        let face_album = fx.resolver.registry().by_hash(&hash).unwrap().clone();
        let key = FaceLocator::new("2021/trip", "1.jpg", hash.clone()).section_key();

        let locator = fx.resolver.erase_face(&face_album.key, &key).await.unwrap();
        assert_eq!(locator.entry_name, "1.jpg");
        assert!(!fx.metadata.snapshot(&face_album.album()).contains_key(&key));
        assert!(fx
            .metadata
            .snapshot(&trip())
            .get("1.jpg")
            .and_then(|s| s.get(FACES_FIELD))
            .is_none());

        assert!(matches!(
            fx.resolver.erase_face("face:Nobody", &key).await,
            Err(ResolveError::Registry(RegistryError::UnknownAlbum(_)))
        ));
        assert!(matches!(
            fx.resolver.erase_face(&face_album.key, "%%%").await,
            Err(ResolveError::Locator(_))
        ));
    }
}
