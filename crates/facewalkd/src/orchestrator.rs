//! Scan orchestrator.
//!
//! One pass walks every album, fills the per-entry feature cache through the
//! detector, resolves unresolved faces (geometric pass, then the join pass),
//! reconciles face album counts and back-references, and exports crops. The
//! loop then sleeps for the scan interval and starts over.

use crate::detector::Detector;
use crate::presence::Presence;
use crate::queue::{QueueOrder, QueueProgress, TaskQueue};
use crate::resolver::{read_album_contacts, MergeReport, ResolveError, Resolution, Resolver};
use anyhow::Context;
use facewalk_core::{Album, FaceAlbum, FeatureRecord, IdentityHash, MediaRef};
use facewalk_store::{AlbumSource, FeatureCache, MetadataStore, ThumbnailExporter};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// How often queue progress is logged while extraction drains.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    EnumeratingAlbums,
    ImportingContacts,
    BuildingIdentityRegistry,
    ExtractingFeatures,
    GeometricPass,
    DistanceMatchingPass,
    Exporting,
    Sleeping,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub extract_concurrency: usize,
    pub export_concurrency: usize,
    pub queue_order: QueueOrder,
    pub interval: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            extract_concurrency: 30,
            export_concurrency: 4,
            queue_order: QueueOrder::Lifo,
            interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// External collaborators of the scan loop.
pub struct Collaborators {
    pub albums: Arc<dyn AlbumSource>,
    pub metadata: Arc<dyn MetadataStore>,
    pub detector: Option<Arc<dyn Detector>>,
    pub exporter: Arc<dyn ThumbnailExporter>,
}

/// Summary of one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub albums: usize,
    pub contacts_imported: usize,
    pub entries: usize,
    pub detected: usize,
    pub detection_failures: usize,
    pub correlated: usize,
    pub derived: usize,
    pub reused: usize,
    pub created: usize,
    pub counted: usize,
    pub orphaned: usize,
    pub exported: usize,
    pub export_failures: usize,
    pub identities: usize,
}

/// Detectable entries of one album, after extraction.
#[derive(Debug, Default)]
struct AlbumScan {
    entries: Vec<MediaRef>,
    detected: usize,
    failures: usize,
}

pub struct Orchestrator {
    settings: ScanSettings,
    albums: Arc<dyn AlbumSource>,
    metadata: Arc<dyn MetadataStore>,
    detector: Option<Arc<dyn Detector>>,
    exporter: Arc<dyn ThumbnailExporter>,
    features: FeatureCache,
    resolver: tokio::sync::Mutex<Resolver>,
    presence: Presence,
    extract_queue: TaskQueue,
    visited: Mutex<HashSet<String>>,
    state: watch::Sender<ScanState>,
    identity_count: watch::Sender<usize>,
}

impl Orchestrator {
    pub fn new(
        settings: ScanSettings,
        collaborators: Collaborators,
        features: FeatureCache,
        resolver: Resolver,
        presence: Presence,
    ) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        let (identity_count, _) = watch::channel(resolver.registry().len());
        Self {
            extract_queue: TaskQueue::new(settings.extract_concurrency, settings.queue_order),
            settings,
            albums: collaborators.albums,
            metadata: collaborators.metadata,
            detector: collaborators.detector,
            exporter: collaborators.exporter,
            features,
            resolver: tokio::sync::Mutex::new(resolver),
            presence,
            visited: Mutex::new(HashSet::new()),
            state,
            identity_count,
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn extraction_progress(&self) -> QueueProgress {
        self.extract_queue.progress()
    }

    /// Identity count as of the last registry change. Never waits on a running pass.
    pub fn identity_count(&self) -> usize {
        *self.identity_count.borrow()
    }

    fn publish_identities(&self, resolver: &Resolver) {
        self.identity_count.send_if_modified(|n| {
            let len = resolver.registry().len();
            std::mem::replace(n, len) != len
        });
    }

    fn set_state(&self, state: ScanState) {
        tracing::info!(state = ?state, "scan state");
        self.state.send_replace(state);
    }

    /// Scan forever: one pass, then sleep for the configured interval.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.run_pass().await {
                Ok(report) => tracing::info!(
                    albums = report.albums,
                    entries = report.entries,
                    created = report.created,
                    reused = report.reused,
                    derived = report.derived,
                    correlated = report.correlated,
                    identities = report.identities,
                    exported = report.exported,
                    "scan pass complete"
                ),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "scan pass failed"),
            }
            self.set_state(ScanState::Sleeping);
            tokio::time::sleep(self.settings.interval).await;
        }
    }

    pub async fn run_pass(self: &Arc<Self>) -> anyhow::Result<PassReport> {
        let mut report = PassReport::default();

        self.set_state(ScanState::EnumeratingAlbums);
        let albums = self.albums.list_albums().await.context("listing albums")?;
        report.albums = albums.len();
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.set_state(ScanState::ImportingContacts);
        let mut imported = Vec::new();
        for album in &albums {
            match read_album_contacts(self.metadata.as_ref(), album).await {
                Ok(contacts) => imported.push(contacts),
                Err(e) => tracing::warn!(album = %album.key, error = %e, "contact import failed; skipping album contacts"),
            }
        }

        self.set_state(ScanState::BuildingIdentityRegistry);
        {
            let mut resolver = self.resolver.lock().await;
            resolver.begin_pass();
            for contacts in imported {
                report.contacts_imported += resolver.import_contacts(contacts);
            }
            self.publish_identities(&resolver);
        }

        self.set_state(ScanState::ExtractingFeatures);
        let scans = self.extract_all(&albums).await;
        for scan in &scans {
            report.entries += scan.entries.len();
            report.detected += scan.detected;
            report.detection_failures += scan.failures;
        }

        self.set_state(ScanState::GeometricPass);
        {
            let mut resolver = self.resolver.lock().await;
            for media in scans.iter().flat_map(|s| &s.entries) {
                let Some(mut features) = self.unresolved(media).await else {
                    continue;
                };
                match resolver.correlate_entry(media, &mut features).await {
                    Ok(outcome) => {
                        report.correlated += outcome.correlated;
                        report.derived += outcome.derived;
                    }
                    Err(e) => tracing::warn!(media = %media, error = %e, "geometric pass failed for entry"),
                }
            }
        }

        self.set_state(ScanState::DistanceMatchingPass);
        {
            let mut resolver = self.resolver.lock().await;
            for media in scans.iter().flat_map(|s| &s.entries) {
                let Some(mut features) = self.unresolved(media).await else {
                    continue;
                };
                match resolver.resolve_entry(media, &mut features).await {
                    Ok(resolutions) => {
                        for r in &resolutions {
                            match r {
                                Resolution::Created(_) => report.created += 1,
                                Resolution::Reused { .. } => report.reused += 1,
                            }
                        }
                    }
                    Err(e) => tracing::warn!(media = %media, error = %e, "identity matching failed for entry"),
                }
            }
            for album in &albums {
                match resolver.reconcile_album(album, self.albums.as_ref()).await {
                    Ok(outcome) => {
                        report.counted += outcome.counted;
                        report.orphaned += outcome.orphaned;
                    }
                    Err(e) => tracing::warn!(album = %album.key, error = %e, "reconciliation failed for album"),
                }
            }
            report.identities = resolver.registry().len();
            self.publish_identities(&resolver);
        }

        self.set_state(ScanState::Exporting);
        let (exported, failures) = self.export_all().await?;
        report.exported = exported;
        report.export_failures = failures;

        Ok(report)
    }

    /// Cached features of `media`, if any of them still lack an identity.
    async fn unresolved(&self, media: &MediaRef) -> Option<Vec<FeatureRecord>> {
        let features = self.features.read(media).await?;
        features.iter().any(|f| !f.is_resolved()).then_some(features)
    }

    async fn extract_all(self: &Arc<Self>, albums: &[Album]) -> Vec<AlbumScan> {
        let handles: Vec<_> = albums
            .iter()
            .map(|album| {
                let this = Arc::clone(self);
                let album = album.clone();
                let key = album.key.clone();
                let handle = self
                    .extract_queue
                    .submit(move || async move { this.extract_album(&album).await });
                (key, handle)
            })
            .collect();

        let drained = self.extract_queue.drain();
        tokio::pin!(drained);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut drained => break,
                _ = ticker.tick() => {
                    let p = self.extract_queue.progress();
                    tracing::info!(remaining = p.waiting + p.in_flight, completed = p.completed, "processing faces");
                }
            }
        }

        // Results are gathered in album order regardless of completion order.
        let mut scans = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            match handle.await {
                Ok(scan) => scans.push(scan),
                Err(e) => tracing::warn!(album = %key, error = %e, "album extraction failed"),
            }
        }
        scans
    }

    async fn extract_album(&self, album: &Album) -> anyhow::Result<AlbumScan> {
        let first_visit = self
            .visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(album.key.clone());
        if !first_visit {
            tracing::debug!(album = %album.key, "album already visited this pass");
            return Ok(AlbumScan::default());
        }

        let entries = self
            .albums
            .read_entries(album)
            .await
            .with_context(|| format!("reading entries of {}", album.key))?;

        let mut scan = AlbumScan::default();
        for media in entries.into_iter().filter(MediaRef::is_detectable) {
            if self.presence.active() > 0 {
                tracing::debug!(album = %album.key, "interactive client attached; pausing extraction");
            }
            self.presence.wait_idle().await;

            if self.features.read(&media).await.is_none() {
                if let Some(detector) = &self.detector {
                    match self.detect(detector.as_ref(), &media).await {
                        Ok(features) => {
                            tracing::info!(media = %media, faces = features.len(), "features generated");
                            self.features.write(&media, &features);
                            scan.detected += 1;
                        }
                        Err(e) => {
                            // Recorded as empty so the entry is not retried until it changes.
                            tracing::warn!(media = %media, error = %format!("{e:#}"), "feature extraction failed");
                            self.features.write(&media, &[]);
                            scan.failures += 1;
                        }
                    }
                }
            }
            scan.entries.push(media);
        }
        Ok(scan)
    }

    async fn detect(&self, detector: &dyn Detector, media: &MediaRef) -> anyhow::Result<Vec<FeatureRecord>> {
        let bytes = self.albums.read_media(media).await?;
        let detections = detector.detect(&bytes).await?;
        Ok(detections.into_iter().map(|d| d.into_feature()).collect())
    }

    /// Render every live face crop. Returns `(exported, failed)`.
    async fn export_all(&self) -> anyhow::Result<(usize, usize)> {
        let requests = {
            let resolver = self.resolver.lock().await;
            resolver.export_requests().await.context("collecting face crops")?
        };

        let queue = TaskQueue::new(self.settings.export_concurrency, QueueOrder::Lifo);
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let exporter = Arc::clone(&self.exporter);
                queue.submit(move || async move {
                    exporter
                        .export_crop(&request)
                        .await
                        .with_context(|| format!("exporting crop of {}", request.media))
                })
            })
            .collect();
        queue.drain().await;

        let (mut exported, mut failed) = (0, 0);
        for handle in handles {
            match handle.await {
                Ok(_) => exported += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "face crop export failed");
                    failed += 1;
                }
            }
        }
        Ok((exported, failed))
    }

    pub async fn identities(&self) -> Vec<FaceAlbum> {
        self.resolver.lock().await.registry().get_all()
    }

    pub async fn merge_identities(
        &self,
        target: &IdentityHash,
        source: &IdentityHash,
    ) -> Result<MergeReport, ResolveError> {
        let mut resolver = self.resolver.lock().await;
        let report = resolver.merge(target, source, self.albums.as_ref()).await?;
        self.publish_identities(&resolver);
        Ok(report)
    }

    /// Erase one face instance and its exported crop.
    pub async fn erase_face(&self, face_album_key: &str, section_key: &str) -> Result<(), ResolveError> {
        let locator = self
            .resolver
            .lock()
            .await
            .erase_face(face_album_key, section_key)
            .await?;
        if let Err(e) = self.exporter.delete_crop(&locator).await {
            tracing::warn!(hash = %locator.hash, error = %e, "failed to delete face crop");
        }
        Ok(())
    }

    /// Flush pending cache writes. Returns the number of files written.
    pub async fn flush(&self) -> usize {
        self.resolver.lock().await.flush().await
    }
}
