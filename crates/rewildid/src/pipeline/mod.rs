pub mod config;
pub mod context;
pub mod process;
pub mod progress;

pub use config::ExecutorSettings;
pub use context::TaskContext;
pub use process::{parse_line, PipelineCommand, PipelineEvent, PipelineStatus};
pub use progress::{ExecutorReport, ProgressReporter, RecordingProgress};
