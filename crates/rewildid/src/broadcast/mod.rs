pub mod snapshot;

pub use snapshot::SnapshotBroadcaster;
