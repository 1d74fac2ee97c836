//! Per-type task adapters run by the executor.

pub mod detect;
pub mod import;
pub mod reid;
pub mod thumbnail;

use std::sync::Arc;

pub use detect::DetectTask;
pub use import::ImportTask;
pub use reid::ReidTask;
pub use thumbnail::ThumbnailTask;

use crate::catalog::ImageCatalog;
use crate::pipeline::config::ExecutorSettings;
use crate::pipeline::process::PipelineCommand;
use crate::worker::executor::TaskSet;

/// The standard adapters, backed by `catalog` and the configured pipeline.
pub fn default_tasks(catalog: Arc<dyn ImageCatalog>, settings: &ExecutorSettings) -> TaskSet {
    let command = PipelineCommand::from_settings(settings);
    TaskSet {
        import: Arc::new(ImportTask::new(Arc::clone(&catalog))),
        thumbnail: Arc::new(ThumbnailTask::new(Arc::clone(&catalog))),
        detect: Arc::new(DetectTask::new(Arc::clone(&catalog), command.clone())),
        reid: Arc::new(ReidTask::new(catalog, command)),
    }
}
