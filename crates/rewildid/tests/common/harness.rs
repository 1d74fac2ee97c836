//! Test harness for isolated test execution.
//!
//! The `TestHarness` owns a temporary library and inbox and builds configs
//! and application state rooted in them.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use rewildid::catalog::{ImageCatalog, ImageId, InMemoryCatalog};
use rewildid::config::{load_config_from_str, Config};
use rewildid::jobs::{Job, JobId, JobStore};
use rewildid::state::AppState;

/// Test harness providing an isolated library for integration tests.
pub struct TestHarness {
    temp_dir: TempDir,
    /// Library root that imports are copied into.
    pub library_dir: PathBuf,
    /// Directory holding "camera card" files to import.
    pub inbox_dir: PathBuf,
    /// Catalog shared with the state built by [`TestHarness::state`].
    pub catalog: Arc<InMemoryCatalog>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let library_dir = temp_dir.path().join("library");
        let inbox_dir = temp_dir.path().join("inbox");
        std::fs::create_dir_all(&library_dir).expect("Failed to create library dir");
        std::fs::create_dir_all(&inbox_dir).expect("Failed to create inbox dir");

        Self {
            temp_dir,
            library_dir,
            inbox_dir,
            catalog: Arc::new(InMemoryCatalog::new()),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a small solid-colour JPEG into the inbox.
    pub fn write_photo(&self, filename: &str) -> PathBuf {
        let path = self.inbox_dir.join(filename);
        image::RgbImage::from_pixel(64, 48, image::Rgb([92, 120, 64]))
            .save(&path)
            .expect("Failed to write photo");
        path
    }

    /// Minimal valid config rooted at the harness library.
    pub fn config(&self) -> Config {
        let json = serde_json::json!({
            "version": "1.0",
            "library_directory": self.library_dir.display().to_string(),
            "worker_count": 2,
            "thumbnails": { "max_dimension": 32 },
        });
        load_config_from_str(&json.to_string()).expect("Harness config is invalid")
    }

    /// Config whose pipeline program is `script`, run through `/bin/sh -c`.
    pub fn config_with_pipeline(&self, script: &str) -> Config {
        let mut config = self.config();
        config.pipeline.program = "/bin/sh".to_string();
        config.pipeline.args = vec!["-c".to_string(), script.to_string()];
        config
    }

    /// Writes `contents` as a config file in the temp dir.
    pub fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.temp_path().join("rewildid.json");
        std::fs::write(&path, contents).expect("Failed to write config file");
        path
    }

    /// Application state on the current tokio runtime.
    pub fn state(&self, config: Config) -> AppState {
        let catalog: Arc<dyn ImageCatalog> = self.catalog.clone();
        AppState::new(config, catalog, tokio::runtime::Handle::current())
    }

    /// Catalog id of the imported image whose file name is `filename`.
    pub fn image_id(&self, filename: &str) -> ImageId {
        self.catalog
            .all_images()
            .into_iter()
            .find(|r| r.path.file_name().is_some_and(|n| n == filename))
            .map(|r| r.id)
            .unwrap_or_else(|| panic!("{} was not imported", filename))
    }
}

/// Polls the store until `predicate` holds for job `id`.
pub async fn wait_for<F>(store: &JobStore, id: &JobId, predicate: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = store.get(id) {
            if predicate(&job) {
                return job;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting on job {}: {:?}", id, store.get(id));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_terminal(store: &JobStore, id: &JobId) -> Job {
    wait_for(store, id, |job| job.is_terminal()).await
}
