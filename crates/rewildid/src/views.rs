//! Views derived from a job snapshot. None of them hold job state of their
//! own beyond what a single watcher remembers.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::jobs::lock_or_recover;
use crate::jobs::model::{Job, JobId, JobStatus, JobType, Snapshot};
use crate::jobs::store::JobStore;
use crate::jobs::subscription::Subscription;

/// Number of pending or running jobs, shown as a badge.
pub fn active_count(jobs: &[Job]) -> usize {
    jobs.iter().filter(|j| j.status.is_active()).count()
}

/// Application view that shows the results of a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppView {
    Library,
    Classification,
    Reid,
}

pub fn view_target(job_type: JobType) -> AppView {
    match job_type {
        JobType::Import | JobType::Thumbnail => AppView::Library,
        JobType::Detect => AppView::Classification,
        JobType::Reid => AppView::Reid,
    }
}

/// Detects jobs of watched types that newly reached `completed`.
///
/// Completions present when the watcher is created are treated as already
/// seen. The seen set only grows and belongs to this watcher alone.
#[derive(Debug, Clone)]
pub struct CompletionWatcher {
    watched: HashSet<JobType>,
    seen: HashSet<JobId>,
}

impl CompletionWatcher {
    pub fn new(types: impl IntoIterator<Item = JobType>, initial: &[Job]) -> Self {
        let watched: HashSet<JobType> = types.into_iter().collect();
        let seen = initial
            .iter()
            .filter(|j| j.status == JobStatus::Completed && watched.contains(&j.job_type))
            .map(|j| j.id)
            .collect();
        Self { watched, seen }
    }

    /// New completions in `jobs`, oldest first. Each job is returned once.
    pub fn observe(&mut self, jobs: &[Job]) -> Vec<Job> {
        let mut fresh: Vec<Job> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed && self.watched.contains(&j.job_type))
            .filter(|j| self.seen.insert(j.id))
            .cloned()
            .collect();
        fresh.reverse();
        fresh
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Calls `on_complete` once for every job of `types` that completes after
/// this call.
pub fn watch_completions<F>(
    store: &JobStore,
    types: impl IntoIterator<Item = JobType>,
    on_complete: F,
) -> Subscription
where
    F: Fn(&Job) + Send + Sync + 'static,
{
    let watcher = Mutex::new(CompletionWatcher::new(types, &store.get_snapshot()));
    store.subscribe(move |snapshot: &Snapshot| {
        let fresh = lock_or_recover(&watcher, "completion watcher").observe(snapshot);
        for job in &fresh {
            on_complete(job);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobPayload;
    use crate::pipeline::progress::ExecutorReport;
    use crate::worker::manual::ManualExecutor;
    use std::sync::Arc;

    fn succeed(executor: &ManualExecutor, id: &JobId) {
        executor.job(id).unwrap().report(ExecutorReport::Succeeded {
            message: "done".to_string(),
        });
    }

    #[test]
    fn test_view_targets() {
        assert_eq!(view_target(JobType::Import), AppView::Library);
        assert_eq!(view_target(JobType::Thumbnail), AppView::Library);
        assert_eq!(view_target(JobType::Detect), AppView::Classification);
        assert_eq!(view_target(JobType::Reid), AppView::Reid);
    }

    #[test]
    fn test_active_count_matches_statuses() {
        let executor = Arc::new(ManualExecutor::new());
        let store = JobStore::new(executor.clone());
        let a = store.enqueue(JobPayload::Detect { image_ids: vec![1] }).unwrap();
        let b = store.enqueue(JobPayload::Detect { image_ids: vec![2] }).unwrap();
        store.enqueue(JobPayload::Detect { image_ids: vec![3] }).unwrap();
        succeed(&executor, &a);
        executor.job(&b).unwrap().report(ExecutorReport::Started {
            message: "Starting".to_string(),
        });

        let snapshot = store.get_snapshot();
        assert_eq!(active_count(&snapshot), 2);
        assert_eq!(active_count(&snapshot), store.counts().active());
    }

    #[test]
    fn test_banner_ignores_completions_present_at_mount() {
        let executor = Arc::new(ManualExecutor::new());
        let store = JobStore::new(executor.clone());
        let old = store.enqueue(JobPayload::Detect { image_ids: vec![1] }).unwrap();
        succeed(&executor, &old);

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let _banner = watch_completions(&store, [JobType::Detect], move |job| {
            sink.lock().unwrap().push(job.id);
        });

        // Unrelated mutation: nothing fires.
        store.enqueue(JobPayload::Thumbnail { image_ids: vec![1] }).unwrap();
        assert!(fired.lock().unwrap().is_empty());

        let new = store.enqueue(JobPayload::Detect { image_ids: vec![2] }).unwrap();
        succeed(&executor, &new);
        store.enqueue(JobPayload::Detect { image_ids: vec![3] }).unwrap();

        assert_eq!(*fired.lock().unwrap(), vec![new]);
    }

    #[test]
    fn test_watcher_skips_unwatched_types() {
        let executor = Arc::new(ManualExecutor::new());
        let store = JobStore::new(executor.clone());
        let mut watcher = CompletionWatcher::new([JobType::Reid], &store.get_snapshot());

        let detect = store.enqueue(JobPayload::Detect { image_ids: vec![1] }).unwrap();
        succeed(&executor, &detect);
        assert!(watcher.observe(&store.get_snapshot()).is_empty());

        let reid = store
            .enqueue(JobPayload::Reid {
                image_ids: vec![1],
                species: "stoat".to_string(),
            })
            .unwrap();
        succeed(&executor, &reid);
        let fresh = watcher.observe(&store.get_snapshot());
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, reid);
        assert!(watcher.observe(&store.get_snapshot()).is_empty());
        assert_eq!(watcher.seen_count(), 1);
    }

    #[test]
    fn test_watchers_do_not_share_seen_sets() {
        let executor = Arc::new(ManualExecutor::new());
        let store = JobStore::new(executor.clone());
        let mut first = CompletionWatcher::new([JobType::Detect], &store.get_snapshot());
        let mut second = first.clone();

        let id = store.enqueue(JobPayload::Detect { image_ids: vec![1] }).unwrap();
        succeed(&executor, &id);

        assert_eq!(first.observe(&store.get_snapshot()).len(), 1);
        assert_eq!(second.observe(&store.get_snapshot()).len(), 1);
    }
}
