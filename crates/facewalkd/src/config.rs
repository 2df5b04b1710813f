use crate::queue::QueueOrder;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration: defaults, then an optional TOML file, then `FACEWALK_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory whose picture folders are scanned as albums.
    pub images_root: PathBuf,
    /// Faces root: reference features, per-entry cache, face album metadata, thumbnails.
    pub data_dir: PathBuf,
    /// Detector command line. Without one, only cached features are resolved.
    pub detector_command: Option<String>,
    /// Albums extracted concurrently.
    pub extract_concurrency: usize,
    /// Thumbnails rendered concurrently.
    pub export_concurrency: usize,
    /// Debounce window for cache writes, in seconds.
    pub debounce_secs: u64,
    /// Sleep between scan passes, in seconds.
    pub scan_interval_secs: u64,
    /// Distance under which the join pass reuses an identity.
    pub strict_threshold: f32,
    /// Distance under which the derived-hash pass adopts a reference.
    pub loose_threshold: f32,
    pub queue_order: QueueOrder,
    /// Serve the control interface on the session bus.
    pub dbus: bool,
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".local/share"))
            .join("facewalk")
            .join("faces");

        Self {
            images_root: home_dir().join("Pictures"),
            data_dir,
            detector_command: None,
            extract_concurrency: 30,
            export_concurrency: 4,
            debounce_secs: 20,
            scan_interval_secs: 24 * 60 * 60,
            strict_threshold: facewalk_core::STRICT_THRESHOLD,
            loose_threshold: facewalk_core::LOOSE_THRESHOLD,
            queue_order: QueueOrder::Lifo,
            dbus: true,
        }
    }
}

impl Config {
    /// Load from `FACEWALK_CONFIG` (if set) and `FACEWALK_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("FACEWALK_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEWALK_*` overrides read through `var`. Unparsable values are ignored.
    pub fn with_overrides(self, var: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            images_root: get("FACEWALK_IMAGES_ROOT").map(PathBuf::from).unwrap_or(self.images_root),
            data_dir: get("FACEWALK_DATA_DIR").map(PathBuf::from).unwrap_or(self.data_dir),
            detector_command: get("FACEWALK_DETECTOR_COMMAND").or(self.detector_command),
            extract_concurrency: parsed(&get, "FACEWALK_EXTRACT_CONCURRENCY", self.extract_concurrency),
            export_concurrency: parsed(&get, "FACEWALK_EXPORT_CONCURRENCY", self.export_concurrency),
            debounce_secs: parsed(&get, "FACEWALK_DEBOUNCE_SECS", self.debounce_secs),
            scan_interval_secs: parsed(&get, "FACEWALK_SCAN_INTERVAL_SECS", self.scan_interval_secs),
            strict_threshold: parsed(&get, "FACEWALK_STRICT_THRESHOLD", self.strict_threshold),
            loose_threshold: parsed(&get, "FACEWALK_LOOSE_THRESHOLD", self.loose_threshold),
            queue_order: parsed(&get, "FACEWALK_QUEUE_ORDER", self.queue_order),
            dbus: get("FACEWALK_DBUS").map(|v| v != "0").unwrap_or(self.dbus),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Global reference feature blob.
    pub fn reference_features_path(&self) -> PathBuf {
        self.data_dir.join("referenceFeatures.json")
    }

    /// Root of the per-entry feature cache.
    pub fn feature_cache_dir(&self) -> PathBuf {
        self.data_dir.join("references")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.data_dir.join("thumbnails")
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
