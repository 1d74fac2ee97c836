pub mod model;
pub mod store;
pub mod subscription;

use std::sync::{Mutex, MutexGuard};

pub use model::{
    Job, JobCounts, JobId, JobPayload, JobStatus, JobType, RetryContext, Snapshot, WorkUnit,
};
pub use store::JobStore;
pub use subscription::Subscription;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("{} lock was poisoned, recovering", what);
        poisoned.into_inner()
    })
}
