use std::sync::Arc;

use tokio::sync::broadcast;

use crate::jobs::model::Snapshot;
use crate::jobs::store::JobStore;
use crate::jobs::subscription::Subscription;

/// Re-publishes store snapshots on a tokio broadcast channel, for consumers
/// that live on async tasks or across a process boundary.
///
/// Every message is a full snapshot, so a receiver that lags only misses
/// intermediate states.
#[derive(Clone)]
pub struct SnapshotBroadcaster {
    sender: Arc<broadcast::Sender<Snapshot>>,
}

impl SnapshotBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, snapshot: Snapshot) {
        // No receivers is fine
        let _ = self.sender.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forwards every broadcast of `store` until the returned subscription
    /// is dropped.
    pub fn attach(&self, store: &JobStore) -> Subscription {
        let sender = Arc::clone(&self.sender);
        store.subscribe(move |snapshot| {
            let _ = sender.send(Arc::clone(snapshot));
        })
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobPayload, JobStatus};
    use crate::worker::manual::ManualExecutor;

    #[tokio::test]
    async fn test_attach_forwards_snapshots() {
        let store = JobStore::new(Arc::new(ManualExecutor::new()));
        let broadcaster = SnapshotBroadcaster::default();
        let _forwarding = broadcaster.attach(&store);
        let mut rx = broadcaster.subscribe();

        let id = store
            .enqueue(JobPayload::Detect { image_ids: vec![1] })
            .unwrap();
        store.cancel(&id);

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].status, JobStatus::Pending);
        let second = rx.recv().await.unwrap();
        assert_eq!(second[0].status, JobStatus::Cancelled);
    }

    #[test]
    fn test_send_without_receivers() {
        let broadcaster = SnapshotBroadcaster::new(4);
        broadcaster.send(Snapshot::default());
        assert_eq!(broadcaster.receiver_count(), 0);
    }
}
