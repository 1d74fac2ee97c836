//! Job records and the value types they are built from.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::ImageId;
use crate::error::EnqueueError;

/// Full ordered job list, newest first. Cheap to clone and never mutated
/// once handed out.
pub type Snapshot = Arc<Vec<Job>>;

/// Opaque job identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Import,
    Thumbnail,
    Detect,
    Reid,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Import,
        JobType::Thumbnail,
        JobType::Detect,
        JobType::Reid,
    ];

    /// Whether a failed or cancelled job of this type can be retried with
    /// its completed units skipped.
    pub fn is_retryable(self) -> bool {
        matches!(self, JobType::Import | JobType::Detect | JobType::Reid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::Thumbnail => "thumbnail",
            JobType::Detect => "detect",
            JobType::Reid => "reid",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// `pending -> running -> completed | failed`, and `pending | running ->
/// cancelled`. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Type-specific input needed to (re)start a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobPayload {
    /// Files and folders to copy into the library, optionally into a named group.
    Import {
        paths: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    Thumbnail { image_ids: Vec<ImageId> },
    Detect { image_ids: Vec<ImageId> },
    Reid {
        image_ids: Vec<ImageId>,
        species: String,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Import { .. } => JobType::Import,
            JobPayload::Thumbnail { .. } => JobType::Thumbnail,
            JobPayload::Detect { .. } => JobType::Detect,
            JobPayload::Reid { .. } => JobType::Reid,
        }
    }

    /// Number of top-level inputs (paths or image IDs).
    pub fn input_count(&self) -> usize {
        match self {
            JobPayload::Import { paths, .. } => paths.len(),
            JobPayload::Thumbnail { image_ids }
            | JobPayload::Detect { image_ids }
            | JobPayload::Reid { image_ids, .. } => image_ids.len(),
        }
    }

    /// Enqueue-time validation. Callers may run this up front; `enqueue`
    /// runs it as well.
    pub fn validate(&self) -> Result<(), EnqueueError> {
        if self.input_count() == 0 {
            return Err(EnqueueError::EmptyPayload {
                job_type: self.job_type(),
            });
        }
        if let JobPayload::Reid { species, .. } = self {
            if species.trim().is_empty() {
                return Err(EnqueueError::MissingSpecies);
            }
        }
        Ok(())
    }
}

/// A sub-unit of work that can be skipped on retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum WorkUnit {
    /// A source file handed to an import job.
    File(PathBuf),
    /// An image that has been classified.
    Image(ImageId),
}

/// Sub-units already processed by this job or the attempts it retries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    pub completed: BTreeSet<WorkUnit>,
}

impl RetryContext {
    pub fn contains(&self, unit: &WorkUnit) -> bool {
        self.completed.contains(unit)
    }

    pub fn extend<I: IntoIterator<Item = WorkUnit>>(&mut self, units: I) -> bool {
        let before = self.completed.len();
        self.completed.extend(units);
        self.completed.len() != before
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

/// A tracked unit of asynchronous background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Percentage in `[0, 100]`. Only meaningful while running.
    pub progress: f32,
    /// Current step, replaced on every update.
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only when `status` is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: JobPayload,
    pub retry_context: RetryContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        payload: JobPayload,
        retry_context: RetryContext,
        retry_of: Option<JobId>,
    ) -> Self {
        let message = if retry_of.is_some() {
            "Queued for retry".to_string()
        } else {
            "Queued".to_string()
        };
        Self {
            id,
            job_type: payload.job_type(),
            status: JobStatus::Pending,
            progress: 0.0,
            message,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
            payload,
            retry_context,
            retry_of,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A job can be retried when it stopped short and its type keeps
    /// per-unit progress.
    pub fn can_retry(&self) -> bool {
        self.job_type.is_retryable()
            && matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}
