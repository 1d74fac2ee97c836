use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub library_directory: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Buffered snapshots per event-bridge receiver.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_event_capacity() -> usize {
    64
}

impl Config {
    pub fn library_path(&self) -> PathBuf {
        PathBuf::from(&self.library_directory)
    }

    pub fn thumbnail_path(&self) -> PathBuf {
        match &self.thumbnails.directory {
            Some(dir) => PathBuf::from(dir),
            None => self.library_path().join(".thumbnails"),
        }
    }

    pub fn work_path(&self) -> PathBuf {
        match &self.pipeline.work_directory {
            Some(dir) => PathBuf::from(dir),
            None => self.library_path().join(".work"),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        match &self.pipeline.log_directory {
            Some(dir) => PathBuf::from(dir),
            None => self.work_path().join("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

fn default_max_dimension() -> u32 {
    320
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_dimension: default_max_dimension(),
        }
    }
}

/// External detection / re-identification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the per-command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_directory: Option<String>,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub embedding_cache: Option<String>,
    #[serde(default = "default_detect_batch_size")]
    pub detect_batch_size: usize,
    #[serde(default = "default_reid_batch_size")]
    pub reid_batch_size: usize,
    /// Fail a running job that reports nothing for this many seconds.
    #[serde(default)]
    pub stall_timeout_secs: Option<u64>,
}

fn default_program() -> String {
    "rewild-pipeline".to_string()
}

fn default_detect_batch_size() -> usize {
    64
}

fn default_reid_batch_size() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            work_directory: None,
            log_directory: None,
            embedding_cache: None,
            detect_batch_size: default_detect_batch_size(),
            reid_batch_size: default_reid_batch_size(),
            stall_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
