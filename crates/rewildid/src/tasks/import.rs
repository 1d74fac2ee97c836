//! Copies source images into the library and registers them.
//!
//! Unit: one source file. Failure policy: the job fails when the library
//! destination cannot be created, or when every file failed. Individual
//! copy or registration errors are counted in the summary.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{ImageCatalog, ImageId};
use crate::error::TaskError;
use crate::jobs::model::{JobPayload, JobType, WorkUnit};
use crate::pipeline::context::TaskContext;
use crate::worker::executor::{JobTask, TaskOutcome};

const UNGROUPED: &str = "ungrouped";
const MAX_NAME_ATTEMPTS: u32 = 10_000;

pub struct ImportTask {
    catalog: Arc<dyn ImageCatalog>,
}

impl ImportTask {
    pub fn new(catalog: Arc<dyn ImageCatalog>) -> Self {
        Self { catalog }
    }

    async fn import_one(
        &self,
        source: &Path,
        destination_dir: &Path,
        group: Option<&str>,
    ) -> Result<ImageId, TaskError> {
        let file_name = source.file_name().ok_or_else(|| {
            TaskError::io(
                source,
                std::io::Error::new(ErrorKind::InvalidInput, "not a file path"),
            )
        })?;

        let mut reader = File::open(source)
            .await
            .map_err(|e| TaskError::io(source, e))?;
        let (mut writer, destination) =
            create_unique_file(&destination_dir.join(file_name)).await?;

        let copied = async {
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = copied {
            drop(writer);
            if let Err(cleanup) = fs::remove_file(&destination).await {
                warn!("Could not remove partial copy {}: {}", destination.display(), cleanup);
            }
            return Err(TaskError::io(source, e));
        }

        let id = self.catalog.register_import(&destination, group)?;
        debug!("Imported {} as image {}", source.display(), id);
        Ok(id)
    }
}

#[async_trait]
impl JobTask for ImportTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let JobPayload::Import { paths, group } = ctx.payload() else {
            return Err(TaskError::PayloadMismatch {
                expected: JobType::Import,
            });
        };

        let folder = group_folder(group.as_deref());
        let destination_dir = ctx.settings().library_directory.join(&folder);
        fs::create_dir_all(&destination_dir)
            .await
            .map_err(|e| TaskError::io(&destination_dir, e))?;

        let sources = paths.clone();
        let (files, mut errors) = tokio::task::spawn_blocking(move || collect_image_files(&sources))
            .await
            .map_err(|e| TaskError::Join(e.to_string()))?;

        let total = files.len();
        if total == 0 {
            return Err(TaskError::AllUnitsFailed(format!(
                "no image files found in {} path(s)",
                paths.len()
            )));
        }
        info!("Importing {} file(s) into {}", total, destination_dir.display());

        let group = group.as_deref().map(str::trim).filter(|g| !g.is_empty());
        let mut imported = 0usize;
        let mut skipped = 0usize;
        for (index, file) in files.iter().enumerate() {
            ctx.check_cancelled()?;

            let unit = WorkUnit::File(file.clone());
            if ctx.skip().contains(&unit) {
                skipped += 1;
            } else {
                match self.import_one(file, &destination_dir, group).await {
                    Ok(_) => {
                        imported += 1;
                        ctx.units_completed(vec![unit]);
                    }
                    Err(e) => {
                        warn!("Failed to import {}: {}", file.display(), e);
                        errors.push(e.to_string());
                    }
                }
            }

            ctx.progress(index + 1, total, format!("Imported {}/{}", index + 1, total));
        }

        if imported == 0 && skipped == 0 {
            let first = errors.first().cloned().unwrap_or_default();
            return Err(TaskError::AllUnitsFailed(format!(
                "all {} file(s) failed to import: {}",
                total, first
            )));
        }

        let mut summary = format!("Imported {} file(s)", imported);
        if skipped > 0 {
            summary.push_str(&format!(", {} already imported", skipped));
        }
        if !errors.is_empty() {
            summary.push_str(&format!(", {} failed", errors.len()));
        }
        Ok(TaskOutcome::new(summary))
    }
}

/// Library sub-folder for a group name.
fn group_folder(group: Option<&str>) -> String {
    let cleaned: String = group
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        UNGROUPED.to_string()
    } else {
        cleaned
    }
}

fn is_image_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    if hidden {
        return false;
    }
    mime_guess::from_path(path)
        .first_raw()
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false)
}

/// Expands folders into the image files beneath them. Explicit files are
/// always taken. The result is sorted and free of duplicates. Missing paths
/// are returned as errors.
fn collect_image_files(paths: &[PathBuf]) -> (Vec<PathBuf>, Vec<String>) {
    let mut files = BTreeSet::new();
    let mut errors = Vec::new();

    for path in paths {
        if path.is_dir() {
            let found: Vec<PathBuf> = WalkDir::new(path)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| is_image_file(p))
                .collect();
            debug!("Found {} image(s) under {}", found.len(), path.display());
            files.extend(found);
        } else if path.is_file() {
            files.insert(path.clone());
        } else {
            errors.push(format!("{}: not found", path.display()));
        }
    }

    (files.into_iter().collect(), errors)
}

/// `name.jpg`, then `name_1.jpg`, `name_2.jpg`, ... for `attempt` 0, 1, 2.
fn candidate_name(path: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let extension = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}_{}{}", stem, attempt, extension))
}

/// Creates the first free name derived from `path`. The name is claimed by
/// the create-new open itself, so concurrent imports never share a file.
async fn create_unique_file(path: &Path) -> Result<(File, PathBuf), TaskError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = candidate_name(path, attempt);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(TaskError::io(&candidate, e)),
        }
    }
    Err(TaskError::io(
        path,
        std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free name after {} attempts", MAX_NAME_ATTEMPTS),
        ),
    ))
}
