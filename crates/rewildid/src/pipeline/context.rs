use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::TaskError;
use crate::jobs::model::{JobId, JobPayload, RetryContext, WorkUnit};
use crate::pipeline::config::ExecutorSettings;
use crate::pipeline::progress::{ExecutorReport, ProgressReporter};
use crate::worker::executor::ExecutionRequest;

/// Per-run view handed to a task: its inputs, a progress sink and the
/// cancel signal.
pub struct TaskContext {
    request: ExecutionRequest,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    settings: Arc<ExecutorSettings>,
}

impl TaskContext {
    pub fn new(
        request: ExecutionRequest,
        reporter: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
        settings: Arc<ExecutorSettings>,
    ) -> Self {
        Self {
            request,
            reporter,
            cancel,
            settings,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.request.job_id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.request.payload
    }

    /// Units an earlier attempt already finished.
    pub fn skip(&self) -> &RetryContext {
        &self.request.skip
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reports `done` of `total` units as a percentage.
    pub fn progress(&self, done: usize, total: usize, message: impl Into<String>) {
        let percent = if total == 0 {
            100.0
        } else {
            (done.min(total) as f32 / total as f32) * 100.0
        };
        self.report_percent(percent, message);
    }

    pub fn report_percent(&self, progress: f32, message: impl Into<String>) {
        self.reporter.report(ExecutorReport::Progress {
            progress,
            message: message.into(),
        });
    }

    pub fn units_completed(&self, units: Vec<WorkUnit>) {
        if !units.is_empty() {
            self.reporter.report(ExecutorReport::UnitsCompleted(units));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
