use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

/// Settings shared by every task the executor runs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub library_directory: PathBuf,
    pub thumbnail_directory: PathBuf,
    pub thumbnail_max_dimension: u32,
    pub program: String,
    pub program_args: Vec<String>,
    pub work_directory: PathBuf,
    pub log_directory: PathBuf,
    pub embedding_cache: Option<PathBuf>,
    pub detect_batch_size: usize,
    pub reid_batch_size: usize,
    pub worker_count: usize,
    pub stall_timeout: Option<Duration>,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            library_directory: config.library_path(),
            thumbnail_directory: config.thumbnail_path(),
            thumbnail_max_dimension: config.thumbnails.max_dimension,
            program: config.pipeline.program.clone(),
            program_args: config.pipeline.args.clone(),
            work_directory: config.work_path(),
            log_directory: config.log_path(),
            embedding_cache: config.pipeline.embedding_cache.as_ref().map(PathBuf::from),
            detect_batch_size: config.pipeline.detect_batch_size,
            reid_batch_size: config.pipeline.reid_batch_size,
            worker_count: config.worker_count,
            stall_timeout: config.pipeline.stall_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Defaults rooted at `library`, as if loaded from a minimal config.
    pub fn for_library(library: impl Into<PathBuf>) -> Self {
        let library_directory = library.into();
        let work_directory = library_directory.join(".work");
        Self {
            thumbnail_directory: library_directory.join(".thumbnails"),
            thumbnail_max_dimension: 320,
            program: "rewild-pipeline".to_string(),
            program_args: Vec::new(),
            log_directory: work_directory.join("logs"),
            work_directory,
            embedding_cache: None,
            detect_batch_size: 64,
            reid_batch_size: 4,
            worker_count: num_cpus::get(),
            stall_timeout: None,
            library_directory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn test_from_config_resolves_paths() {
        let config = load_config_from_str(
            r#"{ "version": "1.0", "library_directory": "/lib", "worker_count": 3,
                 "pipeline": { "stall_timeout_secs": 90 } }"#,
        )
        .unwrap();
        let settings = ExecutorSettings::from_config(&config);
        assert_eq!(settings.worker_count, 3);
        assert_eq!(settings.thumbnail_directory, PathBuf::from("/lib/.thumbnails"));
        assert_eq!(settings.log_directory, PathBuf::from("/lib/.work/logs"));
        assert_eq!(settings.stall_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_for_library_matches_minimal_config() {
        let config =
            load_config_from_str(r#"{ "version": "1.0", "library_directory": "/lib" }"#).unwrap();
        let from_config = ExecutorSettings::from_config(&config);
        let direct = ExecutorSettings::for_library("/lib");
        assert_eq!(from_config.work_directory, direct.work_directory);
        assert_eq!(from_config.thumbnail_directory, direct.thumbnail_directory);
        assert_eq!(from_config.program, direct.program);
        assert_eq!(from_config.detect_batch_size, direct.detect_batch_size);
    }
}
