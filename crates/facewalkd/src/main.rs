use anyhow::Result;
use facewalk_store::{
    AlbumSource, DebouncedWriter, FeatureCache, FileSink, FsAlbumSource, ImageCropExporter, JsonMetadataStore,
    MetadataStore, ReferenceStore,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector;
mod orchestrator;
mod presence;
mod queue;
mod registry;
mod resolver;

use config::Config;
use detector::{CommandDetector, Detector};
use orchestrator::{Collaborators, Orchestrator, ScanSettings};
use presence::Presence;
use registry::IdentityRegistry;
use resolver::{Resolver, Thresholds};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        images = %config.images_root.display(),
        data = %config.data_dir.display(),
        "facewalkd starting"
    );

    let features = FeatureCache::new(
        config.feature_cache_dir(),
        DebouncedWriter::spawn(config.debounce(), Arc::new(FileSink)),
    );
    let references = ReferenceStore::load(
        config.reference_features_path(),
        DebouncedWriter::spawn(config.debounce(), Arc::new(FileSink)),
    )
    .await;
    let metadata: Arc<dyn MetadataStore> = Arc::new(JsonMetadataStore::new(&config.images_root, &config.data_dir));
    let albums: Arc<dyn AlbumSource> = Arc::new(FsAlbumSource::new(&config.images_root));
    let exporter = Arc::new(ImageCropExporter::new(&config.images_root, config.thumbnails_dir()));

    let detector: Option<Arc<dyn Detector>> = match config.detector_command.as_deref().and_then(CommandDetector::from_command_line) {
        Some(d) => {
            tracing::info!(program = d.program(), "external detector configured");
            Some(Arc::new(d) as Arc<dyn Detector>)
        }
        None => {
            tracing::warn!("no detector configured (FACEWALK_DETECTOR_COMMAND); resolving cached features only");
            None
        }
    };

    let resolver = Resolver::new(
        IdentityRegistry::new(),
        references,
        features.clone(),
        metadata.clone(),
        Thresholds {
            strict: config.strict_threshold,
            loose: config.loose_threshold,
        },
    );
    let presence = Presence::new();
    let orchestrator = Arc::new(Orchestrator::new(
        ScanSettings {
            extract_concurrency: config.extract_concurrency,
            export_concurrency: config.export_concurrency,
            queue_order: config.queue_order,
            interval: config.scan_interval(),
        },
        Collaborators {
            albums,
            metadata,
            detector,
            exporter,
        },
        features,
        resolver,
        presence.clone(),
    ));

    // Held for the lifetime of the process; dropping it releases the bus name.
    let _bus = if config.dbus {
        match dbus_interface::serve(orchestrator.clone(), presence).await {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; running without control interface");
                None
            }
        }
    } else {
        None
    };

    let scan = tokio::spawn(orchestrator.clone().run());
    tracing::info!("facewalkd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewalkd shutting down");

    scan.abort();
    let _ = scan.await;
    let flushed = orchestrator.flush().await;
    tracing::info!(flushed, "pending cache writes flushed");

    Ok(())
}
