pub mod executor;
pub mod manual;

pub use executor::{
    ExecutionHandle, ExecutionRequest, JobExecutor, JobTask, TaskExecutor, TaskOutcome, TaskSet,
};
pub use manual::{ManualExecutor, StartedJob};
