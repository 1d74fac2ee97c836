//! Event bridge from job snapshots to the UI transport.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::broadcast::SnapshotBroadcaster;
use crate::jobs::model::{Job, JobCounts};
use crate::views::active_count;

/// Event names seen by the frontend.
pub mod event_names {
    pub const JOBS: &str = "rewild://jobs";
}

/// Transport that delivers named JSON events to the UI (an IPC channel, a
/// websocket, a test recorder).
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), String>;
}

/// Payload of [`event_names::JOBS`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsEventPayload<'a> {
    pub jobs: &'a [Job],
    pub active_count: usize,
    pub counts: JobCounts,
}

impl<'a> JobsEventPayload<'a> {
    pub fn new(jobs: &'a [Job]) -> Self {
        Self {
            jobs,
            active_count: active_count(jobs),
            counts: JobCounts::from_jobs(jobs),
        }
    }
}

/// Spawns a task that emits every snapshot from `broadcaster` as a
/// [`event_names::JOBS`] event. Ends when the broadcaster is dropped.
///
/// Must be called from within a tokio runtime.
pub fn start_event_bridge(
    broadcaster: &SnapshotBroadcaster,
    emitter: Arc<dyn EventEmitter>,
) -> JoinHandle<()> {
    info!("Starting job event bridge");
    let mut rx = broadcaster.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let payload = match serde_json::to_value(JobsEventPayload::new(&snapshot)) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Failed to serialize job snapshot: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = emitter.emit(event_names::JOBS, payload) {
                        debug!("Failed to emit jobs event: {}", e);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Job event bridge lagged, skipped {} snapshots", n);
                }
                Err(RecvError::Closed) => {
                    info!("Snapshot broadcaster closed, stopping job event bridge");
                    break;
                }
            }
        }
    })
}
