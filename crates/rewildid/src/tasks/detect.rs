//! Detection and species classification through the external pipeline.
//!
//! Unit: one image. Images are sent in batches; every batch writes a
//! manifest, runs `detection <manifest> <marked_dir> <json_dir> <log_dir>`
//! and reads one `<stem>.json` result per image back into the catalog.
//!
//! Failure policy: IDs missing from the catalog and images without a result
//! file are tolerated and counted. A failed batch fails the job; images from
//! earlier batches stay recorded so a retry skips them.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::catalog::{DetectionBox, ImageCatalog, ImageId, ImageRecord};
use crate::error::TaskError;
use crate::jobs::model::{JobPayload, JobType, WorkUnit};
use crate::pipeline::context::TaskContext;
use crate::pipeline::process::{PipelineCommand, PipelineEvent, PipelineStatus};
use crate::worker::executor::{JobTask, TaskOutcome};

/// Input file for the detection command.
#[derive(Debug, Serialize)]
struct DetectionManifest {
    files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_path: Option<String>,
    image_id_map: BTreeMap<String, ImageId>,
}

/// Per-image result file written by the detection command.
#[derive(Debug, Deserialize)]
struct DetectionResult {
    #[serde(default)]
    boxes: Vec<DetectionBox>,
}

/// Share of overall job progress covered by one classification pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressSpan {
    pub start: f32,
    pub end: f32,
}

impl ProgressSpan {
    pub const FULL: ProgressSpan = ProgressSpan {
        start: 0.0,
        end: 100.0,
    };

    pub fn at(&self, fraction: f32) -> f32 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClassifySummary {
    pub classified: usize,
    pub without_result: usize,
}

/// Splits `records` into batches of at most `size` images with distinct
/// file stems, since the pipeline names result files by stem.
fn plan_batches(records: Vec<ImageRecord>, size: usize) -> Vec<Vec<ImageRecord>> {
    let size = size.max(1);
    let mut batches: Vec<(HashSet<String>, Vec<ImageRecord>)> = Vec::new();

    for record in records {
        let stem = file_stem(&record.path);
        let slot = batches
            .iter_mut()
            .find(|(stems, batch)| batch.len() < size && !stems.contains(&stem));
        match slot {
            Some((stems, batch)) => {
                stems.insert(stem);
                batch.push(record);
            }
            None => {
                let mut stems = HashSet::new();
                stems.insert(stem);
                batches.push((stems, vec![record]));
            }
        }
    }

    batches.into_iter().map(|(_, batch)| batch).collect()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Classifies `records` batch by batch, reporting progress inside `span`.
pub(crate) async fn classify_images(
    ctx: &TaskContext,
    catalog: &dyn ImageCatalog,
    command: &PipelineCommand,
    records: Vec<ImageRecord>,
    span: ProgressSpan,
) -> Result<ClassifySummary, TaskError> {
    let mut summary = ClassifySummary::default();
    let total = records.len();
    if total == 0 {
        return Ok(summary);
    }

    let settings = ctx.settings();
    let job_dir = settings.work_directory.join(ctx.job_id().to_string());
    fs::create_dir_all(&settings.log_directory)
        .await
        .map_err(|e| TaskError::io(&settings.log_directory, e))?;

    let batches = plan_batches(records, settings.detect_batch_size);
    info!("Classifying {} image(s) in {} batch(es)", total, batches.len());

    let mut processed = 0usize;
    for (number, batch) in batches.into_iter().enumerate() {
        ctx.check_cancelled()?;

        let batch_dir = job_dir.join(format!("detect-{}", number + 1));
        let marked_dir = batch_dir.join("marked");
        let json_dir = batch_dir.join("json");
        for dir in [&marked_dir, &json_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| TaskError::io(dir, e))?;
        }

        let manifest_path = batch_dir.join("manifest.json");
        write_manifest(&manifest_path, &batch, settings.embedding_cache.as_deref()).await?;

        let args: Vec<OsString> = vec![
            "detection".into(),
            manifest_path.clone().into_os_string(),
            marked_dir.into_os_string(),
            json_dir.clone().into_os_string(),
            settings.log_directory.clone().into_os_string(),
        ];

        let batch_len = batch.len();
        let before = processed;
        command
            .run(&args, ctx.cancel_token(), |event| match event {
                PipelineEvent::Progress { done, total: batch_total } if batch_total > 0 => {
                    let in_batch = batch_len as f32 * done.min(batch_total) as f32
                        / batch_total as f32;
                    let overall = (before as f32 + in_batch) / total as f32;
                    ctx.report_percent(
                        span.at(overall),
                        format!("Classifying images {}/{}", before + in_batch as usize, total),
                    );
                }
                PipelineEvent::Status(PipelineStatus::Begin) => {
                    debug!("Detection batch {} started", number + 1);
                }
                _ => {}
            })
            .await?;

        let mut units = Vec::with_capacity(batch_len);
        for record in &batch {
            match read_result(&json_dir, &record.path).await {
                Ok(Some(result)) => {
                    catalog.record_detections(record.id, &result.boxes)?;
                    units.push(WorkUnit::Image(record.id));
                    summary.classified += 1;
                }
                Ok(None) => {
                    warn!("No detection result for {}", record.path.display());
                    summary.without_result += 1;
                }
                Err(e) => {
                    warn!("Unreadable detection result: {}", e);
                    summary.without_result += 1;
                }
            }
        }
        ctx.units_completed(units);

        processed += batch_len;
        ctx.report_percent(
            span.at(processed as f32 / total as f32),
            format!("Classifying images {}/{}", processed, total),
        );
    }

    Ok(summary)
}

async fn write_manifest(
    path: &Path,
    batch: &[ImageRecord],
    embedding_cache: Option<&Path>,
) -> Result<(), TaskError> {
    let mut manifest = DetectionManifest {
        files: Vec::with_capacity(batch.len()),
        db_path: embedding_cache.map(|p| p.display().to_string()),
        image_id_map: BTreeMap::new(),
    };
    for record in batch {
        let file = record.path.display().to_string();
        manifest.image_id_map.insert(file.clone(), record.id);
        manifest.files.push(file);
    }

    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| TaskError::PipelineOutput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, json).await.map_err(|e| TaskError::io(path, e))
}

async fn read_result(json_dir: &Path, image: &Path) -> Result<Option<DetectionResult>, TaskError> {
    let result_path: PathBuf = json_dir.join(format!("{}.json", file_stem(image)));
    let content = match fs::read(&result_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TaskError::io(&result_path, e)),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| TaskError::PipelineOutput {
            path: result_path,
            reason: e.to_string(),
        })
}

pub struct DetectTask {
    catalog: Arc<dyn ImageCatalog>,
    command: PipelineCommand,
}

impl DetectTask {
    pub fn new(catalog: Arc<dyn ImageCatalog>, command: PipelineCommand) -> Self {
        Self { catalog, command }
    }
}

#[async_trait]
impl JobTask for DetectTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let JobPayload::Detect { image_ids } = ctx.payload() else {
            return Err(TaskError::PayloadMismatch {
                expected: JobType::Detect,
            });
        };

        let records = self.catalog.images(image_ids)?;
        let missing = image_ids.len().saturating_sub(records.len());
        if records.is_empty() {
            return Err(TaskError::AllUnitsFailed(format!(
                "none of the {} image(s) are in the catalog",
                image_ids.len()
            )));
        }

        let (skipped, pending): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| ctx.skip().contains(&WorkUnit::Image(r.id)));

        let summary = classify_images(
            ctx,
            self.catalog.as_ref(),
            &self.command,
            pending,
            ProgressSpan::FULL,
        )
        .await?;

        let mut message = format!("Classified {} image(s)", summary.classified);
        if !skipped.is_empty() {
            message.push_str(&format!(", {} already classified", skipped.len()));
        }
        if summary.without_result > 0 {
            message.push_str(&format!(", {} without result", summary.without_result));
        }
        if missing > 0 {
            message.push_str(&format!(", {} unknown", missing));
        }
        Ok(TaskOutcome::new(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ImageId, path: &str) -> ImageRecord {
        ImageRecord {
            id,
            path: PathBuf::from(path),
            group: None,
            thumbnail: None,
            classified: false,
        }
    }

    fn ids(batches: &[Vec<ImageRecord>]) -> Vec<Vec<ImageId>> {
        batches
            .iter()
            .map(|b| b.iter().map(|r| r.id).collect())
            .collect()
    }

    #[test]
    fn test_plan_batches_respects_size() {
        let records = (1..=5).map(|i| record(i, &format!("/lib/{}.jpg", i))).collect();
        assert_eq!(
            ids(&plan_batches(records, 2)),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
    }

    #[test]
    fn test_plan_batches_separates_equal_stems() {
        let records = vec![
            record(1, "/lib/north/IMG_1.jpg"),
            record(2, "/lib/south/IMG_1.jpg"),
            record(3, "/lib/south/IMG_2.jpg"),
        ];
        assert_eq!(ids(&plan_batches(records, 10)), vec![vec![1, 3], vec![2]]);
    }

    #[test]
    fn test_progress_span() {
        let span = ProgressSpan {
            start: 0.0,
            end: 50.0,
        };
        assert_eq!(span.at(0.5), 25.0);
        assert_eq!(span.at(2.0), 50.0);
        assert_eq!(ProgressSpan::FULL.at(0.25), 25.0);
    }

    #[test]
    fn test_manifest_shape() {
        let manifest = DetectionManifest {
            files: vec!["/lib/a.jpg".to_string()],
            db_path: None,
            image_id_map: BTreeMap::from([("/lib/a.jpg".to_string(), 7)]),
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["files"][0], "/lib/a.jpg");
        assert_eq!(json["image_id_map"]["/lib/a.jpg"], 7);
        assert!(json.get("db_path").is_none());
    }
}
