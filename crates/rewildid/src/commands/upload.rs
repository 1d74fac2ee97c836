//! File upload commands. Picked files and folders are handed to an import
//! job, which copies them into the library in the background.

use std::path::PathBuf;

use log::{info, warn};
use serde::Serialize;

use super::ApiResponse;
use crate::jobs::model::JobPayload;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub job_id: String,
    pub paths_queued: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Queue an import of `file_paths` (files or folders) into `group`.
/// Paths that do not exist are reported and left out.
pub fn upload_files(
    state: &AppState,
    file_paths: Vec<String>,
    group: Option<String>,
) -> ApiResponse<UploadResult> {
    let mut paths = Vec::with_capacity(file_paths.len());
    let mut errors = Vec::new();

    for file_path in file_paths {
        let path = PathBuf::from(&file_path);
        if path.exists() {
            paths.push(path);
        } else {
            warn!("Skipping missing upload path: {}", file_path);
            errors.push(format!("File not found: {}", file_path));
        }
    }

    if paths.is_empty() {
        return ApiResponse::err(match errors.first() {
            Some(first) => first.clone(),
            None => "No files selected".to_string(),
        });
    }

    let paths_queued = paths.len();
    let group = group.filter(|g| !g.trim().is_empty());
    match state.job_store.enqueue(JobPayload::Import { paths, group }) {
        Ok(id) => {
            info!("Queued import of {} path(s) as job {}", paths_queued, id);
            ApiResponse::ok(UploadResult {
                job_id: id.to_string(),
                paths_queued,
                errors,
            })
        }
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::load_config_from_str;
    use crate::worker::manual::ManualExecutor;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state(executor: Arc<ManualExecutor>) -> AppState {
        let config =
            load_config_from_str(r#"{ "version": "1.0", "library_directory": "/tmp/lib" }"#)
                .unwrap();
        AppState::with_executor(config, Arc::new(InMemoryCatalog::new()), executor)
    }

    #[test]
    fn test_upload_queues_import_job() {
        let dir = TempDir::new().unwrap();
        let photo = dir.path().join("stoat.jpg");
        std::fs::write(&photo, b"jpeg").unwrap();
        let executor = Arc::new(ManualExecutor::new());
        let state = state(executor.clone());

        let response = upload_files(
            &state,
            vec![
                photo.display().to_string(),
                dir.path().join("missing.jpg").display().to_string(),
            ],
            Some("north-ridge".to_string()),
        );

        let result = response.data.unwrap();
        assert_eq!(result.paths_queued, 1);
        assert_eq!(result.errors.len(), 1);

        let started = executor.started();
        assert_eq!(started.len(), 1);
        assert_eq!(
            started[0].request.payload,
            JobPayload::Import {
                paths: vec![photo],
                group: Some("north-ridge".to_string()),
            }
        );
    }

    #[test]
    fn test_upload_without_existing_paths_fails() {
        let executor = Arc::new(ManualExecutor::new());
        let state = state(executor.clone());

        let response = upload_files(&state, vec!["/nonexistent/a.jpg".to_string()], None);
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), "File not found: /nonexistent/a.jpg");

        assert_eq!(
            upload_files(&state, Vec::new(), None).error.unwrap(),
            "No files selected"
        );
        assert_eq!(executor.start_count(), 0);
    }
}
