use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::SIMILARITY_THRESHOLD;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "BIJUTSU_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub similarity: SimilarityConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseType,

    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,

    #[serde(default)]
    pub postgresql_url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a SQLite writer waits for the write lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bijutsu")
        .join("bijutsu.db")
}

fn default_pool_size() -> u32 {
    10
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseType::default(),
            sqlite_path: default_db_path(),
            postgresql_url: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Maximum Hamming distance (out of 64 bits) for two files to be considered similar.
    #[serde(default = "default_similarity_threshold")]
    pub threshold: u32,
}

fn default_similarity_threshold() -> u32 {
    SIMILARITY_THRESHOLD
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Files processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "webm", "mkv", "mov", "avi"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_concurrency() -> usize {
    4
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            video_extensions: default_video_extensions(),
            concurrency: default_concurrency(),
        }
    }
}

impl IngestConfig {
    pub fn is_image_extension(&self, ext: &str) -> bool {
        self.image_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    pub fn is_media_extension(&self, ext: &str) -> bool {
        self.is_image_extension(ext)
            || self.video_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

impl Config {
    /// Load from `$BIJUTSU_CONFIG` or the default location, writing defaults
    /// out if no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
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

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bijutsu")
            .join("config.toml")
    }
}
