//! Application wiring, built once at startup and shared by the command
//! handlers.

use std::path::Path;
use std::sync::Arc;

use log::info;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::broadcast::SnapshotBroadcaster;
use crate::catalog::ImageCatalog;
use crate::config::{load_config, Config};
use crate::error::Result;
use crate::events::{start_event_bridge, EventEmitter};
use crate::jobs::store::JobStore;
use crate::jobs::subscription::Subscription;
use crate::pipeline::config::ExecutorSettings;
use crate::tasks::default_tasks;
use crate::worker::executor::{JobExecutor, TaskExecutor};

pub struct AppState {
    /// Configuration the state was built from.
    pub config: Config,

    /// Directory settings shared with the task adapters.
    pub settings: Arc<ExecutorSettings>,

    /// Persistent image store.
    pub catalog: Arc<dyn ImageCatalog>,

    /// Job lifecycle authority.
    pub job_store: JobStore,

    /// Async fan-out of every job snapshot.
    pub broadcaster: SnapshotBroadcaster,

    /// Keeps `broadcaster` attached to `job_store`.
    forwarding: Subscription,
}

impl AppState {
    /// Builds the state with the standard task adapters, spawning work on
    /// `runtime`.
    pub fn new(config: Config, catalog: Arc<dyn ImageCatalog>, runtime: Handle) -> Self {
        let settings = Arc::new(ExecutorSettings::from_config(&config));
        let tasks = default_tasks(Arc::clone(&catalog), &settings);
        let executor = Arc::new(TaskExecutor::new(runtime, tasks, Arc::clone(&settings)));
        info!(
            "Starting job executor with {} worker slot(s)",
            settings.worker_count
        );
        Self::assemble(config, settings, catalog, executor)
    }

    /// Builds the state around a caller-supplied executor.
    pub fn with_executor(
        config: Config,
        catalog: Arc<dyn ImageCatalog>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let settings = Arc::new(ExecutorSettings::from_config(&config));
        Self::assemble(config, settings, catalog, executor)
    }

    fn assemble(
        config: Config,
        settings: Arc<ExecutorSettings>,
        catalog: Arc<dyn ImageCatalog>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let job_store = JobStore::new(executor);
        let broadcaster = SnapshotBroadcaster::new(config.event_capacity);
        let forwarding = broadcaster.attach(&job_store);

        Self {
            config,
            settings,
            catalog,
            job_store,
            broadcaster,
            forwarding,
        }
    }

    /// Loads the configuration at `path` and builds the state from it.
    pub fn load<P: AsRef<Path>>(
        path: P,
        catalog: Arc<dyn ImageCatalog>,
        runtime: Handle,
    ) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self::new(config, catalog, runtime))
    }

    /// Starts forwarding snapshots to `emitter`. Must be called from within a
    /// tokio runtime.
    pub fn start_event_bridge(&self, emitter: Arc<dyn EventEmitter>) -> JoinHandle<()> {
        start_event_bridge(&self.broadcaster, emitter)
    }

    /// Whether snapshots are still forwarded to `broadcaster`.
    pub fn is_forwarding(&self) -> bool {
        self.forwarding.is_active()
    }
}
