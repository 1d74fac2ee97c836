//! In-memory job store.
//!
//! The store owns every job record for the lifetime of the process. All
//! mutations (enqueue, executor reports, cancel, retry) run through one
//! critical section that applies the change and then broadcasts the new
//! snapshot to subscribers before the next mutation may begin.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;

use super::lock_or_recover;
use super::model::{Job, JobCounts, JobId, JobPayload, JobStatus, RetryContext, Snapshot};
use super::subscription::{self, SubscriberList, Subscription};
use crate::error::EnqueueError;
use crate::pipeline::progress::{ExecutorReport, ProgressReporter};
use crate::worker::executor::{ExecutionHandle, ExecutionRequest, JobExecutor};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Stores whose critical section is held by this thread.
    static DISPATCHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as inside a store's critical section.
struct DispatchScope {
    store_id: u64,
}

impl DispatchScope {
    fn enter(store_id: u64) -> Self {
        DISPATCHING.with(|ids| ids.borrow_mut().push(store_id));
        Self { store_id }
    }

    fn is_active(store_id: u64) -> bool {
        DISPATCHING.with(|ids| ids.borrow().contains(&store_id))
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|ids| {
            let mut ids = ids.borrow_mut();
            if let Some(pos) = ids.iter().rposition(|id| *id == self.store_id) {
                ids.remove(pos);
            }
        });
    }
}

enum Mutation {
    Enqueue(Job),
    Report { job_id: JobId, report: ExecutorReport },
    Cancel { job_id: JobId },
}

#[derive(Default)]
struct StoreState {
    jobs: Snapshot,
    /// Live executor invocations, one per non-terminal dispatched job.
    handles: HashMap<JobId, ExecutionHandle>,
}

/// What one applied mutation asks the critical section to do next.
#[derive(Default)]
struct Effects {
    broadcast: Option<Snapshot>,
    dispatch: Option<ExecutionRequest>,
    cancel: Option<ExecutionHandle>,
}

struct Shared {
    id: u64,
    critical: Mutex<()>,
    deferred: Mutex<VecDeque<Mutation>>,
    state: Mutex<StoreState>,
    subscribers: Arc<Mutex<SubscriberList>>,
    executor: Arc<dyn JobExecutor>,
}

/// Single source of truth for job records.
///
/// Cloning is cheap; all clones share the same jobs and subscribers.
/// Mutations requested by a subscriber while it is being notified are
/// queued and applied, each with its own broadcast, once the current
/// broadcast has finished.
#[derive(Clone)]
pub struct JobStore {
    shared: Arc<Shared>,
}

impl JobStore {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("Creating job store #{}", id);
        Self {
            shared: Arc::new(Shared {
                id,
                critical: Mutex::new(()),
                deferred: Mutex::new(VecDeque::new()),
                state: Mutex::new(StoreState::default()),
                subscribers: Arc::new(Mutex::new(SubscriberList::default())),
                executor,
            }),
        }
    }

    /// Creates a `pending` job and hands it to the executor.
    ///
    /// Only payload validation can fail; no job is created in that case.
    pub fn enqueue(&self, payload: JobPayload) -> Result<JobId, EnqueueError> {
        payload.validate()?;
        let job = Job::new(JobId::new(), payload, RetryContext::default(), None);
        let id = job.id;
        log::info!(
            "Enqueued {} job {} with {} input(s)",
            job.job_type,
            id,
            job.payload.input_count()
        );
        self.shared.submit(Mutation::Enqueue(job));
        Ok(id)
    }

    /// Cancels a pending job at once, or asks the executor to stop a
    /// running one. Ignored for terminal or unknown jobs.
    pub fn cancel(&self, job_id: &JobId) {
        self.shared.submit(Mutation::Cancel { job_id: *job_id });
    }

    /// Starts a new attempt of a failed or cancelled job, skipping the units
    /// the source job already finished.
    ///
    /// Returns `None` when the source is unknown, still active, completed,
    /// or of a type without retry support. The source record is left as is.
    pub fn retry(&self, job_id: &JobId) -> Option<JobId> {
        let source = self.get(job_id)?;
        if !source.can_retry() {
            log::debug!(
                "Ignoring retry of {} job {} in status {}",
                source.job_type,
                source.id,
                source.status
            );
            return None;
        }

        let job = Job::new(
            JobId::new(),
            source.payload.clone(),
            source.retry_context.clone(),
            Some(source.id),
        );
        let id = job.id;
        log::info!(
            "Retrying {} job {} as {} ({} unit(s) already done)",
            source.job_type,
            source.id,
            id,
            source.retry_context.len()
        );
        self.shared.submit(Mutation::Enqueue(job));
        Some(id)
    }

    /// Current job list, newest first.
    pub fn get_snapshot(&self) -> Snapshot {
        Arc::clone(&lock_or_recover(&self.shared.state, "job state").jobs)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.get_snapshot().iter().find(|j| &j.id == job_id).cloned()
    }

    pub fn counts(&self) -> JobCounts {
        JobCounts::from_jobs(&self.get_snapshot())
    }

    /// Registers `callback` for every future broadcast.
    ///
    /// The callback runs on whichever thread performed the mutation and must
    /// not block. It may call back into the store.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        subscription::register(&self.shared.subscribers, Arc::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.shared.subscribers, "subscriber list").len()
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("id", &self.shared.id)
            .field("counts", &self.counts())
            .finish()
    }
}

impl Shared {
    fn submit(self: &Arc<Self>, mutation: Mutation) {
        if DispatchScope::is_active(self.id) {
            lock_or_recover(&self.deferred, "deferred mutations").push_back(mutation);
            return;
        }

        let _critical = lock_or_recover(&self.critical, "critical section");
        let _scope = DispatchScope::enter(self.id);

        let mut next = Some(mutation);
        while let Some(mutation) = next {
            self.run(mutation);
            next = lock_or_recover(&self.deferred, "deferred mutations").pop_front();
        }
    }

    fn run(self: &Arc<Self>, mutation: Mutation) {
        let effects = {
            let mut state = lock_or_recover(&self.state, "job state");
            apply(&mut state, mutation)
        };

        if let Some(handle) = effects.cancel {
            handle.request_cancel();
        }

        if let Some(snapshot) = effects.broadcast {
            let delivery = lock_or_recover(&self.subscribers, "subscriber list").delivery();
            delivery.deliver(&snapshot);
        }

        if let Some(request) = effects.dispatch {
            let job_id = request.job_id;
            let reporter: Arc<dyn ProgressReporter> = Arc::new(StoreReporter {
                store: Arc::downgrade(self),
                job_id,
            });
            let handle = self.executor.start(request, reporter);
            lock_or_recover(&self.state, "job state")
                .handles
                .insert(job_id, handle);
        }
    }
}

fn apply(state: &mut StoreState, mutation: Mutation) -> Effects {
    match mutation {
        Mutation::Enqueue(job) => {
            let request = ExecutionRequest {
                job_id: job.id,
                payload: job.payload.clone(),
                skip: job.retry_context.clone(),
            };
            let jobs = Arc::make_mut(&mut state.jobs);
            let at = jobs.partition_point(|j| j.created_at > job.created_at);
            jobs.insert(at, job);
            Effects {
                broadcast: Some(Arc::clone(&state.jobs)),
                dispatch: Some(request),
                cancel: None,
            }
        }
        Mutation::Report { job_id, report } => apply_report(state, job_id, report),
        Mutation::Cancel { job_id } => apply_cancel(state, job_id),
    }
}

fn apply_report(state: &mut StoreState, job_id: JobId, report: ExecutorReport) -> Effects {
    let Some(index) = state.jobs.iter().position(|j| j.id == job_id) else {
        log::warn!("Report for unknown job {} ignored", job_id);
        return Effects::default();
    };
    if state.jobs[index].is_terminal() {
        log::debug!("Late report for finished job {} ignored", job_id);
        return Effects::default();
    }

    let current = &state.jobs[index];
    let changed = match &report {
        ExecutorReport::Started { .. } => current.status == JobStatus::Pending,
        ExecutorReport::Progress { .. } => true,
        ExecutorReport::UnitsCompleted(units) => {
            units.iter().any(|u| !current.retry_context.contains(u))
        }
        ExecutorReport::Succeeded { .. }
        | ExecutorReport::Failed { .. }
        | ExecutorReport::Cancelled => true,
    };
    if !changed {
        return Effects::default();
    }

    let finished = report.is_terminal();
    let job = &mut Arc::make_mut(&mut state.jobs)[index];
    match report {
        ExecutorReport::Started { message } => {
            job.status = JobStatus::Running;
            job.message = message;
        }
        ExecutorReport::Progress { progress, message } => {
            job.status = JobStatus::Running;
            let progress = if progress.is_finite() {
                progress.clamp(0.0, 100.0)
            } else {
                job.progress
            };
            job.progress = job.progress.max(progress);
            job.message = message;
        }
        ExecutorReport::UnitsCompleted(units) => {
            job.retry_context.extend(units);
        }
        ExecutorReport::Succeeded { message } => {
            log::info!("Job {} completed: {}", job.id, message);
            job.status = JobStatus::Completed;
            job.message = message;
        }
        ExecutorReport::Failed { error } => {
            log::warn!("Job {} failed: {}", job.id, error);
            job.status = JobStatus::Failed;
            job.message = "Failed".to_string();
            job.error = Some(error);
        }
        ExecutorReport::Cancelled => {
            log::info!("Job {} cancelled", job.id);
            job.status = JobStatus::Cancelled;
            job.message = "Cancelled".to_string();
            job.error = None;
        }
    }
    if finished {
        job.finished_at = Some(Utc::now());
        state.handles.remove(&job_id);
    }

    Effects {
        broadcast: Some(Arc::clone(&state.jobs)),
        ..Effects::default()
    }
}

fn apply_cancel(state: &mut StoreState, job_id: JobId) -> Effects {
    let Some(index) = state.jobs.iter().position(|j| j.id == job_id) else {
        log::debug!("Cancel for unknown job {} ignored", job_id);
        return Effects::default();
    };

    let (status, already_requested) = {
        let job = &state.jobs[index];
        (job.status, job.cancel_requested)
    };
    match status {
        JobStatus::Pending => {
            let job = &mut Arc::make_mut(&mut state.jobs)[index];
            job.status = JobStatus::Cancelled;
            job.message = "Cancelled".to_string();
            job.cancel_requested = true;
            job.finished_at = Some(Utc::now());
            log::info!("Cancelled pending job {}", job_id);
            Effects {
                broadcast: Some(Arc::clone(&state.jobs)),
                dispatch: None,
                cancel: state.handles.remove(&job_id),
            }
        }
        JobStatus::Running if !already_requested => {
            let job = &mut Arc::make_mut(&mut state.jobs)[index];
            job.cancel_requested = true;
            job.message = "Cancelling".to_string();
            log::info!("Requested cancel of running job {}", job_id);
            Effects {
                broadcast: Some(Arc::clone(&state.jobs)),
                dispatch: None,
                cancel: state.handles.get(&job_id).cloned(),
            }
        }
        _ => Effects::default(),
    }
}

/// Routes executor reports for one job back into the store.
struct StoreReporter {
    store: Weak<Shared>,
    job_id: JobId,
}

impl ProgressReporter for StoreReporter {
    fn report(&self, report: ExecutorReport) {
        match self.store.upgrade() {
            Some(shared) => shared.submit(Mutation::Report {
                job_id: self.job_id,
                report,
            }),
            None => log::debug!("Store gone, dropping report for job {}", self.job_id),
        }
    }
}
