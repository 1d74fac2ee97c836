use std::sync::{Arc, Mutex};

use super::executor::{ExecutionHandle, ExecutionRequest, JobExecutor};
use crate::jobs::model::JobId;
use crate::pipeline::progress::{ExecutorReport, ProgressReporter};

/// A job handed to a [`ManualExecutor`].
#[derive(Clone)]
pub struct StartedJob {
    pub request: ExecutionRequest,
    pub reporter: Arc<dyn ProgressReporter>,
    pub handle: ExecutionHandle,
}

impl StartedJob {
    pub fn report(&self, report: ExecutorReport) {
        self.reporter.report(report);
    }

    pub fn cancel_requested(&self) -> bool {
        self.handle.is_cancel_requested()
    }
}

/// Executor that never runs anything by itself.
///
/// Every started job is kept so the caller can drive it with explicit
/// reports. Used to script job lifecycles in tests and previews.
#[derive(Default)]
pub struct ManualExecutor {
    started: Mutex<Vec<StartedJob>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<StartedJob> {
        self.started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn start_count(&self) -> usize {
        self.started().len()
    }

    pub fn job(&self, id: &JobId) -> Option<StartedJob> {
        self.started().into_iter().find(|s| &s.request.job_id == id)
    }
}

impl JobExecutor for ManualExecutor {
    fn start(&self, request: ExecutionRequest, reporter: Arc<dyn ProgressReporter>) -> ExecutionHandle {
        let handle = ExecutionHandle::default();
        log::debug!("Manual executor holding job {}", request.job_id);
        self.started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(StartedJob {
                request,
                reporter,
                handle: handle.clone(),
            });
        handle
    }
}
