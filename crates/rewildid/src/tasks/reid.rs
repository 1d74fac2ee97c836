//! Individual re-identification for one species.
//!
//! Images that are not yet classified go through detection first (first half
//! of the progress bar, same unit and retry rules as a detect job). The
//! species' detections are then sent to `reid_v2 <input.json> <batch_size>`
//! and the resulting individuals are stored in the catalog.
//!
//! Failure policy: a failed classification batch or a failed ReID run fails
//! the job. Having no detections of the species is a successful no-op.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use super::detect::{classify_images, ProgressSpan};
use crate::catalog::{DetectionId, ImageCatalog, ImageId, Individual};
use crate::error::TaskError;
use crate::jobs::model::{JobPayload, JobType, WorkUnit};
use crate::pipeline::context::TaskContext;
use crate::pipeline::process::{PipelineCommand, PipelineEvent, PipelineStatus};
use crate::worker::executor::{JobTask, TaskOutcome};

#[derive(Debug, Serialize)]
struct ReidInput<'a> {
    detections: Vec<ReidDetection>,
    output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_path: Option<String>,
    species: &'a str,
}

#[derive(Debug, Serialize)]
struct ReidDetection {
    detection_id: DetectionId,
    image_id: ImageId,
    image_path: String,
    bbox: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ReidOutput {
    individuals: Vec<Individual>,
}

pub struct ReidTask {
    catalog: Arc<dyn ImageCatalog>,
    command: PipelineCommand,
}

impl ReidTask {
    pub fn new(catalog: Arc<dyn ImageCatalog>, command: PipelineCommand) -> Self {
        Self { catalog, command }
    }
}

#[async_trait]
impl JobTask for ReidTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let JobPayload::Reid { image_ids, species } = ctx.payload() else {
            return Err(TaskError::PayloadMismatch {
                expected: JobType::Reid,
            });
        };

        let records = self.catalog.images(image_ids)?;
        let unclassified: Vec<_> = records
            .into_iter()
            .filter(|r| !r.classified && !ctx.skip().contains(&WorkUnit::Image(r.id)))
            .collect();

        let reid_span = if unclassified.is_empty() {
            ProgressSpan::FULL
        } else {
            info!("Classifying {} image(s) before re-identification", unclassified.len());
            classify_images(
                ctx,
                self.catalog.as_ref(),
                &self.command,
                unclassified,
                ProgressSpan {
                    start: 0.0,
                    end: 50.0,
                },
            )
            .await?;
            ProgressSpan {
                start: 50.0,
                end: 100.0,
            }
        };
        ctx.check_cancelled()?;

        let detections = self.catalog.detections_for(image_ids, species)?;
        if detections.is_empty() {
            return Ok(TaskOutcome::new(format!(
                "No {} detections to re-identify",
                species
            )));
        }

        let job_dir = ctx.settings().work_directory.join(ctx.job_id().to_string());
        fs::create_dir_all(&job_dir)
            .await
            .map_err(|e| TaskError::io(&job_dir, e))?;
        let input_path = job_dir.join("reid_input.json");
        let output_path = job_dir.join("reid_output.json");

        // The pipeline crops each detection out of its source image.
        let paths: HashMap<ImageId, String> = self
            .catalog
            .images(image_ids)?
            .into_iter()
            .map(|r| (r.id, r.path.display().to_string()))
            .collect();
        let mut entries = Vec::with_capacity(detections.len());
        for d in &detections {
            let image_path = paths.get(&d.image_id).cloned().ok_or_else(|| {
                TaskError::PipelineOutput {
                    path: input_path.clone(),
                    reason: format!(
                        "detection {} refers to unknown image {}",
                        d.detection_id, d.image_id
                    ),
                }
            })?;
            entries.push(ReidDetection {
                detection_id: d.detection_id,
                image_id: d.image_id,
                image_path,
                bbox: d.bbox.clone(),
            });
        }

        let input = ReidInput {
            detections: entries,
            output_path: output_path.display().to_string(),
            db_path: ctx
                .settings()
                .embedding_cache
                .as_ref()
                .map(|p| p.display().to_string()),
            species: species.as_str(),
        };
        write_json(&input_path, &input).await?;

        let args: Vec<OsString> = vec![
            "reid_v2".into(),
            input_path.clone().into_os_string(),
            ctx.settings().reid_batch_size.to_string().into(),
        ];
        let count = detections.len();
        ctx.report_percent(reid_span.start, format!("Re-identifying {} {}", count, species));
        self.command
            .run(&args, ctx.cancel_token(), |event| match event {
                PipelineEvent::Progress { done, total } if total > 0 => {
                    let fraction = done.min(total) as f32 / total as f32;
                    ctx.report_percent(
                        reid_span.at(fraction),
                        format!("Re-identifying {}/{}", done.min(total), total),
                    );
                }
                PipelineEvent::Status(PipelineStatus::Processing) => {
                    ctx.report_percent(reid_span.start, "Matching individuals");
                }
                _ => {}
            })
            .await?;

        let output = read_output(&output_path).await?;
        self.catalog.record_individuals(species, &output.individuals)?;

        Ok(TaskOutcome::new(format!(
            "Identified {} individual(s) among {} {} detection(s)",
            output.individuals.len(),
            count,
            species
        )))
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TaskError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| TaskError::PipelineOutput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, json).await.map_err(|e| TaskError::io(path, e))
}

async fn read_output(path: &Path) -> Result<ReidOutput, TaskError> {
    let content = fs::read(path).await.map_err(|e| TaskError::io(path, e))?;
    serde_json::from_slice(&content).map_err(|e| TaskError::PipelineOutput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
