use crate::jobs::model::WorkUnit;

/// Streaming updates an executor sends back for one job.
///
/// A run is `Started`, any number of `Progress`/`UnitsCompleted`, then
/// exactly one of `Succeeded`, `Failed` or `Cancelled`. `Cancelled` doubles
/// as the acknowledgment of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorReport {
    Started {
        message: String,
    },
    Progress {
        progress: f32,
        message: String,
    },
    UnitsCompleted(Vec<WorkUnit>),
    Succeeded {
        message: String,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl ExecutorReport {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorReport::Succeeded { .. } | ExecutorReport::Failed { .. } | ExecutorReport::Cancelled
        )
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, report: ExecutorReport);
}

/// Collects every report in arrival order.
#[derive(Default)]
pub struct RecordingProgress {
    pub reports: std::sync::Mutex<Vec<ExecutorReport>>,
}

impl RecordingProgress {
    pub fn take(&self) -> Vec<ExecutorReport> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExecutorReport>> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, report: ExecutorReport) {
        self.lock().push(report);
    }
}
