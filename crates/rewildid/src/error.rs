use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::model::JobType;

#[derive(Error, Debug)]
pub enum RewildError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Enqueue rejected: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Config does not match schema: {errors}")]
    SchemaValidation { errors: String },
}

/// Synchronous rejection of an `enqueue` call. No job is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("{job_type} job has no inputs")]
    EmptyPayload { job_type: JobType },

    #[error("reid job requires a target species")]
    MissingSpecies,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown image: {0}")]
    UnknownImage(i64),

    #[error("Catalog backend failed: {0}")]
    Backend(String),
}

/// Failure raised inside an executor sub-adapter.
///
/// `Cancelled` is the cooperative-cancel acknowledgment and is never stored
/// as a job error.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("cancelled")]
    Cancelled,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("failed to start pipeline '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline exited with {status}: {detail}")]
    PipelineExit { status: String, detail: String },

    #[error("malformed pipeline output '{path}': {reason}")]
    PipelineOutput { path: PathBuf, reason: String },

    #[error("payload does not match a {expected} job")]
    PayloadMismatch { expected: JobType },

    #[error("{0}")]
    AllUnitsFailed(String),

    #[error("background work aborted: {0}")]
    Join(String),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl TaskError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TaskError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RewildError>;
