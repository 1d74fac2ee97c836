//! Executor boundary and the tokio-backed task executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::TaskError;
use crate::jobs::model::{JobId, JobPayload, JobType, RetryContext};
use crate::pipeline::config::ExecutorSettings;
use crate::pipeline::context::TaskContext;
use crate::pipeline::progress::{ExecutorReport, ProgressReporter};

/// Everything an executor needs to (re)start one job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub payload: JobPayload,
    /// Units finished by earlier attempts.
    pub skip: RetryContext,
}

/// Cancel handle for one executor invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Fire-and-forget. The acknowledgment arrives as a terminal report.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Performs the real work of a job and reports back through `reporter`.
///
/// `start` must not block; long-running work belongs on another task or
/// process. Each call corresponds to exactly one job.
pub trait JobExecutor: Send + Sync {
    fn start(&self, request: ExecutionRequest, reporter: Arc<dyn ProgressReporter>) -> ExecutionHandle;
}

/// Outcome of a sub-adapter run that finished on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub summary: String,
}

impl TaskOutcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

/// One sub-adapter per job type.
#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}

/// Sub-adapters keyed by job type.
#[derive(Clone)]
pub struct TaskSet {
    pub import: Arc<dyn JobTask>,
    pub thumbnail: Arc<dyn JobTask>,
    pub detect: Arc<dyn JobTask>,
    pub reid: Arc<dyn JobTask>,
}

impl TaskSet {
    fn task_for(&self, job_type: JobType) -> Arc<dyn JobTask> {
        match job_type {
            JobType::Import => Arc::clone(&self.import),
            JobType::Thumbnail => Arc::clone(&self.thumbnail),
            JobType::Detect => Arc::clone(&self.detect),
            JobType::Reid => Arc::clone(&self.reid),
        }
    }
}

/// Runs each job as a tokio task, at most `worker_count` at a time.
///
/// Jobs waiting for a slot stay `pending`. An optional stall timeout fails a
/// run that goes that long without reporting anything.
pub struct TaskExecutor {
    runtime: Handle,
    tasks: TaskSet,
    settings: Arc<ExecutorSettings>,
    slots: Arc<Semaphore>,
}

impl TaskExecutor {
    /// # Panics
    /// Panics if `settings.worker_count` is 0.
    pub fn new(runtime: Handle, tasks: TaskSet, settings: Arc<ExecutorSettings>) -> Self {
        assert!(settings.worker_count > 0, "worker_count must be > 0");
        let slots = Arc::new(Semaphore::new(settings.worker_count));
        info!("Task executor ready with {} slot(s)", settings.worker_count);
        Self {
            runtime,
            tasks,
            settings,
            slots,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl JobExecutor for TaskExecutor {
    fn start(&self, request: ExecutionRequest, reporter: Arc<dyn ProgressReporter>) -> ExecutionHandle {
        let cancel = CancellationToken::new();
        let handle = ExecutionHandle::new(cancel.clone());

        let job_type = request.payload.job_type();
        let task = self.tasks.task_for(job_type);
        let slots = Arc::clone(&self.slots);
        let settings = Arc::clone(&self.settings);
        let span = tracing::info_span!("task", job_id = %request.job_id, job_type = %job_type);

        self.runtime.spawn(
            async move {
                let _permit = tokio::select! {
                    permit = slots.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            error!("Executor slots closed before job could start");
                            reporter.report(ExecutorReport::Failed {
                                error: "executor shut down".to_string(),
                            });
                            return;
                        }
                    },
                    _ = cancel.cancelled() => {
                        debug!("Cancelled while waiting for a slot");
                        reporter.report(ExecutorReport::Cancelled);
                        return;
                    }
                };

                reporter.report(ExecutorReport::Started {
                    message: format!("Starting {}", job_type),
                });

                let stall_timeout = settings.stall_timeout;
                let (beat, beats) = watch::channel(0u64);
                let heartbeat = Arc::new(Heartbeat {
                    inner: Arc::clone(&reporter),
                    beat,
                });
                let ctx = TaskContext::new(request, heartbeat, cancel, settings);
                let result = run_with_watchdog(task.as_ref(), &ctx, stall_timeout, beats).await;

                let report = match result {
                    Ok(outcome) => {
                        info!("Job finished: {}", outcome.summary);
                        ExecutorReport::Succeeded {
                            message: outcome.summary,
                        }
                    }
                    Err(TaskError::Cancelled) => {
                        info!("Job cancelled");
                        ExecutorReport::Cancelled
                    }
                    Err(e) => {
                        error!("Job failed: {}", e);
                        ExecutorReport::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                reporter.report(report);
            }
            .instrument(span),
        );

        handle
    }
}

/// Forwards task reports and ticks the watchdog on each one.
struct Heartbeat {
    inner: Arc<dyn ProgressReporter>,
    beat: watch::Sender<u64>,
}

impl ProgressReporter for Heartbeat {
    fn report(&self, report: ExecutorReport) {
        self.beat.send_modify(|count| *count = count.wrapping_add(1));
        self.inner.report(report);
    }
}

/// Runs `task`, failing it once `stall_timeout` passes without a report.
async fn run_with_watchdog(
    task: &dyn JobTask,
    ctx: &TaskContext,
    stall_timeout: Option<Duration>,
    mut beats: watch::Receiver<u64>,
) -> Result<TaskOutcome, TaskError> {
    let Some(limit) = stall_timeout else {
        return task.run(ctx).await;
    };

    let run = task.run(ctx);
    tokio::pin!(run);
    loop {
        tokio::select! {
            result = &mut run => return result,
            beat = tokio::time::timeout(limit, beats.changed()) => match beat {
                Ok(Ok(())) => continue,
                // Heartbeat gone, nothing left to watch.
                Ok(Err(_)) => return run.await,
                Err(_) => {
                    warn!("No report for {}s, failing the run", limit.as_secs());
                    return Err(TaskError::TimedOut(limit));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::WorkUnit;
    use crate::pipeline::progress::RecordingProgress;

    struct SleepyTask {
        delay: Duration,
    }

    #[async_trait]
    impl JobTask for SleepyTask {
        async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            }
            ctx.units_completed(vec![WorkUnit::Image(1)]);
            Ok(TaskOutcome::new("slept"))
        }
    }

    struct FailingTask;

    #[async_trait]
    impl JobTask for FailingTask {
        async fn run(&self, _ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            Err(TaskError::AllUnitsFailed("pipeline timeout".to_string()))
        }
    }

    fn task_set(delay: Duration) -> TaskSet {
        let sleepy: Arc<dyn JobTask> = Arc::new(SleepyTask { delay });
        TaskSet {
            import: Arc::clone(&sleepy),
            thumbnail: Arc::clone(&sleepy),
            detect: Arc::new(FailingTask),
            reid: sleepy,
        }
    }

    fn request(payload: JobPayload) -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::new(),
            payload,
            skip: RetryContext::default(),
        }
    }

    fn settings(worker_count: usize, stall_timeout: Option<Duration>) -> Arc<ExecutorSettings> {
        let mut settings = ExecutorSettings::for_library(std::env::temp_dir());
        settings.worker_count = worker_count;
        settings.stall_timeout = stall_timeout;
        Arc::new(settings)
    }

    async fn wait_for_terminal(recorder: &RecordingProgress) -> Vec<ExecutorReport> {
        for _ in 0..200 {
            {
                let reports = recorder.reports.lock().unwrap();
                if reports.last().map(|r| r.is_terminal()).unwrap_or(false) {
                    return reports.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal report");
    }

    #[tokio::test]
    async fn test_success_reports_started_units_and_succeeded() {
        let executor = TaskExecutor::new(
            Handle::current(),
            task_set(Duration::from_millis(5)),
            settings(2, None),
        );
        let recorder = Arc::new(RecordingProgress::default());
        executor.start(
            request(JobPayload::Thumbnail { image_ids: vec![1] }),
            recorder.clone(),
        );

        let reports = wait_for_terminal(&recorder).await;
        assert!(matches!(reports[0], ExecutorReport::Started { .. }));
        assert!(reports.contains(&ExecutorReport::UnitsCompleted(vec![WorkUnit::Image(1)])));
        assert_eq!(
            reports.last().unwrap(),
            &ExecutorReport::Succeeded {
                message: "slept".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failure_is_reported_as_data() {
        let executor = TaskExecutor::new(
            Handle::current(),
            task_set(Duration::from_millis(5)),
            settings(1, None),
        );
        let recorder = Arc::new(RecordingProgress::default());
        executor.start(request(JobPayload::Detect { image_ids: vec![1] }), recorder.clone());

        let reports = wait_for_terminal(&recorder).await;
        assert_eq!(
            reports.last().unwrap(),
            &ExecutorReport::Failed {
                error: "pipeline timeout".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_while_running_is_acknowledged() {
        let executor = TaskExecutor::new(
            Handle::current(),
            task_set(Duration::from_secs(30)),
            settings(1, None),
        );
        let recorder = Arc::new(RecordingProgress::default());
        let handle = executor.start(
            request(JobPayload::Thumbnail { image_ids: vec![1] }),
            recorder.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_cancel();

        let reports = wait_for_terminal(&recorder).await;
        assert_eq!(reports.last().unwrap(), &ExecutorReport::Cancelled);
    }

    #[tokio::test]
    async fn test_queued_job_cancelled_before_it_gets_a_slot() {
        let executor = TaskExecutor::new(
            Handle::current(),
            task_set(Duration::from_secs(30)),
            settings(1, None),
        );
        let busy = Arc::new(RecordingProgress::default());
        let busy_handle = executor.start(
            request(JobPayload::Thumbnail { image_ids: vec![1] }),
            busy.clone(),
        );
        let queued = Arc::new(RecordingProgress::default());
        let queued_handle = executor.start(
            request(JobPayload::Thumbnail { image_ids: vec![2] }),
            queued.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.available_slots(), 0);
        queued_handle.request_cancel();

        let reports = wait_for_terminal(&queued).await;
        assert_eq!(reports, vec![ExecutorReport::Cancelled]);
        busy_handle.request_cancel();
        wait_for_terminal(&busy).await;
    }

    #[tokio::test]
    async fn test_watchdog_fails_stalled_run() {
        let executor = TaskExecutor::new(
            Handle::current(),
            task_set(Duration::from_secs(30)),
            settings(1, Some(Duration::from_millis(30))),
        );
        let recorder = Arc::new(RecordingProgress::default());
        executor.start(request(JobPayload::Reid {
            image_ids: vec![1],
            species: "stoat".to_string(),
        }), recorder.clone());

        let reports = wait_for_terminal(&recorder).await;
        match reports.last().unwrap() {
            ExecutorReport::Failed { error } => assert!(error.starts_with("timed out")),
            other => panic!("unexpected report {:?}", other),
        }
    }

    struct SteadyTask;

    #[async_trait]
    impl JobTask for SteadyTask {
        async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            for step in 1..=10 {
                tokio::time::sleep(Duration::from_millis(15)).await;
                ctx.progress(step, 10, format!("{}/10", step));
            }
            Ok(TaskOutcome::new("steady"))
        }
    }

    #[tokio::test]
    async fn test_watchdog_resets_on_progress() {
        let steady: Arc<dyn JobTask> = Arc::new(SteadyTask);
        let tasks = TaskSet {
            import: Arc::clone(&steady),
            thumbnail: Arc::clone(&steady),
            detect: Arc::clone(&steady),
            reid: steady,
        };
        // The whole run takes well over the limit, but no gap between
        // reports does.
        let executor = TaskExecutor::new(
            Handle::current(),
            tasks,
            settings(1, Some(Duration::from_millis(100))),
        );
        let recorder = Arc::new(RecordingProgress::default());
        executor.start(request(JobPayload::Detect { image_ids: vec![1] }), recorder.clone());

        let reports = wait_for_terminal(&recorder).await;
        assert_eq!(
            reports.last().unwrap(),
            &ExecutorReport::Succeeded {
                message: "steady".to_string()
            }
        );
    }
}
