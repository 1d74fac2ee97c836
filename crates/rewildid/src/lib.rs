pub mod broadcast;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod state;
pub mod tasks;
pub mod views;
pub mod worker;

pub use broadcast::SnapshotBroadcaster;
pub use catalog::{ImageCatalog, InMemoryCatalog};
pub use commands::ApiResponse;
pub use config::{load_config, Config};
pub use error::{CatalogError, ConfigError, EnqueueError, Result, RewildError, TaskError};
pub use events::{start_event_bridge, EventEmitter};
pub use jobs::{Job, JobCounts, JobId, JobPayload, JobStatus, JobType, JobStore, Snapshot, Subscription};
pub use pipeline::{ExecutorReport, ExecutorSettings, ProgressReporter};
pub use state::AppState;
pub use views::{active_count, view_target, watch_completions, AppView, CompletionWatcher};
pub use worker::{ExecutionHandle, ExecutionRequest, JobExecutor, ManualExecutor, TaskExecutor};
