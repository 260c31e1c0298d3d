use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::faces::Metric;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding content-addressed photo files.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    data_dir().join("photos")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Try ArcFace first, then FaceNet.
    #[default]
    Auto,
    ArcFace,
    FaceNet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: EngineBackend,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Fetch missing model files on startup instead of failing.
    #[serde(default = "default_download_models")]
    pub download_models: bool,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("facesort/models")
}

fn default_download_models() -> bool {
    true
}

fn default_intra_threads() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            models_dir: default_models_dir(),
            download_models: default_download_models(),
            intra_threads: default_intra_threads(),
        }
    }
}

/// Per-metric match thresholds. Similarity >= cosine, distance <= euclidean.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_cosine_threshold")]
    pub cosine: f32,

    #[serde(default = "default_euclidean_threshold")]
    pub euclidean: f32,
}

fn default_cosine_threshold() -> f32 {
    0.6
}

fn default_euclidean_threshold() -> f32 {
    1.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cosine: default_cosine_threshold(),
            euclidean: default_euclidean_threshold(),
        }
    }
}

impl Thresholds {
    pub fn for_metric(&self, metric: Metric) -> f32 {
        match metric {
            Metric::Cosine => self.cosine,
            Metric::Euclidean => self.euclidean,
        }
    }

    /// Replace one metric's threshold after validating its range.
    pub fn set(&mut self, metric: Metric, value: f32) -> Result<()> {
        validate_threshold(metric, value)?;
        match metric {
            Metric::Cosine => self.cosine = value,
            Metric::Euclidean => self.euclidean = value,
        }
        Ok(())
    }

    /// Apply `FACESORT_COSINE_THRESHOLD` / `FACESORT_EUCLIDEAN_THRESHOLD`.
    fn apply_env(&mut self) {
        for metric in [Metric::Cosine, Metric::Euclidean] {
            let var = format!("FACESORT_{}_THRESHOLD", metric.as_str().to_uppercase());
            let Ok(raw) = std::env::var(&var) else {
                continue;
            };
            match raw.trim().parse::<f32>() {
                Ok(value) => {
                    if let Err(e) = self.set(metric, value) {
                        tracing::warn!(%var, error = %e, "Ignoring threshold override");
                    }
                }
                Err(_) => tracing::warn!(%var, %raw, "Ignoring unparsable threshold override"),
            }
        }
    }
}

pub fn validate_threshold(metric: Metric, value: f32) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::InvalidSetting(format!(
            "{} threshold must be finite",
            metric
        )));
    }
    let in_range = match metric {
        Metric::Cosine => (-1.0..=1.0).contains(&value),
        Metric::Euclidean => value >= 0.0,
    };
    if !in_range {
        return Err(Error::InvalidSetting(format!(
            "{} threshold out of range: {}",
            metric, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Photos decoded and run through the face engine concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_item_timeout_secs() -> u64 {
    120
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "bmp".to_string(),
        "webp".to_string(),
    ]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            item_timeout_secs: default_item_timeout_secs(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl IngestConfig {
    pub fn item_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.item_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_width")]
    pub default_width: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("facesort/thumbnails")
}

fn default_thumb_width() -> u32 {
    256
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            default_width: default_thumb_width(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facesort")
}

fn default_db_path() -> PathBuf {
    data_dir().join("facesort.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            thresholds: Thresholds::default(),
            ingest: IngestConfig::default(),
            thumbnails: ThumbnailConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACESORT_CONFIG` or the default location, creating a
    /// default file if none exists.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os("FACESORT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config.thresholds.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facesort")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// A configuration rooted entirely under `root`, used for tests and
    /// portable setups.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            db_path: root.join("facesort.db"),
            store: StoreConfig {
                path: root.join("photos"),
            },
            engine: EngineConfig {
                models_dir: root.join("models"),
                download_models: false,
                ..EngineConfig::default()
            },
            thresholds: Thresholds::default(),
            ingest: IngestConfig::default(),
            thumbnails: ThumbnailConfig {
                path: root.join("thumbnails"),
                default_width: default_thumb_width(),
            },
        }
    }
}
