//! Job query and operation commands.

use serde::Serialize;

use super::ApiResponse;
use crate::jobs::model::{Job, JobCounts, JobId, JobPayload};
use crate::state::AppState;
use crate::views::{view_target, AppView};

/// Response carrying the id of a created job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdResponse {
    pub job_id: String,
}

impl From<JobId> for JobIdResponse {
    fn from(id: JobId) -> Self {
        Self {
            job_id: id.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCountsResponse {
    #[serde(flatten)]
    pub counts: JobCounts,
    pub active_count: usize,
}

fn parse_job_id(job_id: &str) -> Result<JobId, String> {
    job_id
        .parse()
        .map_err(|e| format!("Invalid job id '{}': {}", job_id, e))
}

/// Get all jobs, newest first.
pub fn get_jobs(state: &AppState) -> ApiResponse<Vec<Job>> {
    ApiResponse::ok(state.job_store.get_snapshot().to_vec())
}

/// Get a single job by ID.
pub fn get_job(state: &AppState, job_id: &str) -> ApiResponse<Job> {
    let id = match parse_job_id(job_id) {
        Ok(id) => id,
        Err(e) => return ApiResponse::err(e),
    };
    match state.job_store.get(&id) {
        Some(job) => ApiResponse::ok(job),
        None => ApiResponse::err(format!("Job not found: {}", job_id)),
    }
}

/// Submit a new job.
pub fn enqueue_job(state: &AppState, payload: JobPayload) -> ApiResponse<JobIdResponse> {
    match state.job_store.enqueue(payload) {
        Ok(id) => ApiResponse::ok(id.into()),
        Err(e) => ApiResponse::err(e.to_string()),
    }
}

/// Request cancellation. Unknown and finished jobs are left alone.
pub fn cancel_job(state: &AppState, job_id: &str) -> ApiResponse<()> {
    match parse_job_id(job_id) {
        Ok(id) => {
            state.job_store.cancel(&id);
            ApiResponse::ok(())
        }
        Err(e) => ApiResponse::err(e),
    }
}

/// Retry a failed or cancelled job as a new job.
pub fn retry_job(state: &AppState, job_id: &str) -> ApiResponse<JobIdResponse> {
    let id = match parse_job_id(job_id) {
        Ok(id) => id,
        Err(e) => return ApiResponse::err(e),
    };
    match state.job_store.retry(&id) {
        Some(new_id) => ApiResponse::ok(new_id.into()),
        None => ApiResponse::err(format!("Job cannot be retried: {}", job_id)),
    }
}

/// Per-status job counts.
pub fn job_counts(state: &AppState) -> ApiResponse<JobCountsResponse> {
    let counts = state.job_store.counts();
    ApiResponse::ok(JobCountsResponse {
        counts,
        active_count: counts.active(),
    })
}

/// View that shows the results of a job.
pub fn job_view(state: &AppState, job_id: &str) -> ApiResponse<AppView> {
    let id = match parse_job_id(job_id) {
        Ok(id) => id,
        Err(e) => return ApiResponse::err(e),
    };
    match state.job_store.get(&id) {
        Some(job) => ApiResponse::ok(view_target(job.job_type)),
        None => ApiResponse::err(format!("Job not found: {}", job_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::load_config_from_str;
    use crate::jobs::model::JobStatus;
    use crate::pipeline::progress::ExecutorReport;
    use crate::worker::manual::ManualExecutor;
    use std::sync::Arc;

    fn state() -> (AppState, Arc<ManualExecutor>) {
        let config =
            load_config_from_str(r#"{ "version": "1.0", "library_directory": "/tmp/lib" }"#)
                .unwrap();
        let executor = Arc::new(ManualExecutor::new());
        let state =
            AppState::with_executor(config, Arc::new(InMemoryCatalog::new()), executor.clone());
        (state, executor)
    }

    #[test]
    fn test_enqueue_and_get() {
        let (state, _executor) = state();
        let response = enqueue_job(&state, JobPayload::Detect { image_ids: vec![4] });
        assert!(response.success);
        let job_id = response.data.unwrap().job_id;

        let job = get_job(&state, &job_id).data.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(get_jobs(&state).data.unwrap().len(), 1);
        assert_eq!(job_view(&state, &job_id).data, Some(AppView::Classification));
    }

    #[test]
    fn test_invalid_payload_is_an_error_response() {
        let (state, executor) = state();
        let response = enqueue_job(&state, JobPayload::Detect { image_ids: vec![] });
        assert!(!response.success);
        assert!(response.error.unwrap().contains("no inputs"));
        assert_eq!(executor.start_count(), 0);
    }

    #[test]
    fn test_bad_and_unknown_ids() {
        let (state, _executor) = state();
        assert!(get_job(&state, "not-a-uuid")
            .error
            .unwrap()
            .starts_with("Invalid job id"));
        let unknown = JobId::new().to_string();
        assert!(get_job(&state, &unknown).error.unwrap().starts_with("Job not found"));
        assert!(cancel_job(&state, &unknown).success);
        assert!(!retry_job(&state, &unknown).success);
    }

    #[test]
    fn test_cancel_then_retry() {
        let (state, executor) = state();
        let job_id = enqueue_job(&state, JobPayload::Thumbnail { image_ids: vec![1] })
            .data
            .unwrap()
            .job_id;
        assert!(cancel_job(&state, &job_id).success);

        let retried = retry_job(&state, &job_id).data.unwrap().job_id;
        assert_ne!(retried, job_id);
        assert_eq!(executor.start_count(), 2);

        let counts = job_counts(&state).data.unwrap();
        assert_eq!(counts.counts.cancelled, 1);
        assert_eq!(counts.active_count, 1);
    }

    #[test]
    fn test_counts_serialize_flat() {
        let (state, executor) = state();
        let id: JobId = enqueue_job(&state, JobPayload::Detect { image_ids: vec![1] })
            .data
            .unwrap()
            .job_id
            .parse()
            .unwrap();
        executor.job(&id).unwrap().report(ExecutorReport::Failed {
            error: "pipeline exited with status 1".to_string(),
        });

        let json = serde_json::to_value(job_counts(&state)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["failed"], 1);
        assert_eq!(json["data"]["activeCount"], 0);
        assert!(json.get("error").is_none());
    }
}
