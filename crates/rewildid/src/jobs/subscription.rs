//! Snapshot fan-out to registered callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::lock_or_recover;
use super::model::Snapshot;

pub type SnapshotCallback = dyn Fn(&Snapshot) + Send + Sync;

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Arc<SnapshotCallback>,
}

/// Registered callbacks in subscription order.
#[derive(Default)]
pub(crate) struct SubscriberList {
    next_id: u64,
    entries: Vec<Subscriber>,
}

/// Callbacks captured at the start of one broadcast.
pub(crate) struct Delivery {
    targets: Vec<(Arc<AtomicBool>, Arc<SnapshotCallback>)>,
}

impl SubscriberList {
    fn add(&mut self, callback: Arc<SnapshotCallback>) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id;
        self.next_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        self.entries.push(Subscriber {
            id,
            active: Arc::clone(&active),
            callback,
        });
        (id, active)
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|s| s.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Freezes the current subscriber set. Subscribers added afterwards are
    /// not part of this delivery.
    pub(crate) fn delivery(&self) -> Delivery {
        Delivery {
            targets: self
                .entries
                .iter()
                .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
                .collect(),
        }
    }
}

impl Delivery {
    /// Invokes every captured callback that is still subscribed.
    pub(crate) fn deliver(&self, snapshot: &Snapshot) {
        for (active, callback) in &self.targets {
            if active.load(Ordering::Acquire) {
                callback(snapshot);
            }
        }
    }
}

pub(crate) fn register(
    list: &Arc<Mutex<SubscriberList>>,
    callback: Arc<SnapshotCallback>,
) -> Subscription {
    let (id, active) = lock_or_recover(list, "subscriber list").add(callback);
    Subscription {
        id,
        active,
        list: Arc::downgrade(list),
    }
}

/// Handle returned by `JobStore::subscribe`.
///
/// Dropping the handle unsubscribes. `unsubscribe` may be called any number
/// of times, including after the store is gone.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    list: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(list) = self.list.upgrade() {
            lock_or_recover(&list, "subscriber list").remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
