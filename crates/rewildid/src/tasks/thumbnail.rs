//! Preview renditions for library images.
//!
//! Unit: one image. Failure policy: the job fails when the thumbnail
//! directory cannot be created, or when no thumbnail could be written.
//! Unknown IDs and undecodable images are counted in the summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use tracing::{debug, warn};

use crate::catalog::{ImageCatalog, ImageId};
use crate::error::TaskError;
use crate::jobs::model::{JobPayload, JobType, WorkUnit};
use crate::pipeline::context::TaskContext;
use crate::worker::executor::{JobTask, TaskOutcome};

pub struct ThumbnailTask {
    catalog: Arc<dyn ImageCatalog>,
}

impl ThumbnailTask {
    pub fn new(catalog: Arc<dyn ImageCatalog>) -> Self {
        Self { catalog }
    }
}

pub fn thumbnail_path(directory: &Path, id: ImageId) -> PathBuf {
    directory.join(format!("{}.jpg", id))
}

/// Decodes `source`, scales it to fit `max_dimension` and writes a JPEG.
pub fn render_thumbnail(source: &Path, target: &Path, max_dimension: u32) -> Result<(), String> {
    let decoded = image::open(source).map_err(|e| format!("{}: {}", source.display(), e))?;
    let scaled = decoded.thumbnail(max_dimension, max_dimension).to_rgb8();
    scaled
        .save_with_format(target, ImageFormat::Jpeg)
        .map_err(|e| format!("{}: {}", target.display(), e))
}

#[async_trait]
impl JobTask for ThumbnailTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let JobPayload::Thumbnail { image_ids } = ctx.payload() else {
            return Err(TaskError::PayloadMismatch {
                expected: JobType::Thumbnail,
            });
        };

        let directory = ctx.settings().thumbnail_directory.clone();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| TaskError::io(&directory, e))?;

        let records = self.catalog.images(image_ids)?;
        let missing = image_ids.len().saturating_sub(records.len());
        if missing > 0 {
            warn!("{} image(s) not found in catalog", missing);
        }

        let total = records.len();
        let max_dimension = ctx.settings().thumbnail_max_dimension;
        let mut written = 0usize;
        let mut failed = 0usize;
        for (index, record) in records.into_iter().enumerate() {
            ctx.check_cancelled()?;

            if !ctx.skip().contains(&WorkUnit::Image(record.id)) {
                let target = thumbnail_path(&directory, record.id);
                let source = record.path.clone();
                let out = target.clone();
                let rendered = tokio::task::spawn_blocking(move || {
                    render_thumbnail(&source, &out, max_dimension)
                })
                .await
                .map_err(|e| TaskError::Join(e.to_string()))?;

                match rendered {
                    Ok(()) => {
                        self.catalog.set_thumbnail(record.id, &target)?;
                        debug!("Thumbnail for image {} at {}", record.id, target.display());
                        written += 1;
                    }
                    Err(e) => {
                        warn!("Thumbnail failed: {}", e);
                        failed += 1;
                    }
                }
            }

            ctx.progress(index + 1, total, format!("Thumbnails {}/{}", index + 1, total));
        }

        if written == 0 {
            return Err(TaskError::AllUnitsFailed(format!(
                "no thumbnails generated ({} failed, {} unknown)",
                failed, missing
            )));
        }

        let mut summary = format!("Generated {} thumbnail(s)", written);
        if failed + missing > 0 {
            summary.push_str(&format!(", {} skipped", failed + missing));
        }
        Ok(TaskOutcome::new(summary))
    }
}
