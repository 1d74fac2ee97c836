//! Out-of-process pipeline runner.
//!
//! The external detection and re-identification tools report on stdout with
//! a small line protocol:
//!
//! ```text
//! STATUS: BEGIN
//! PROCESS: 3/10
//! STATUS: PROCESSING
//! STATUS: DONE
//! ```
//!
//! Any other line is free-form output. A non-zero exit status means failure.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::pipeline::config::ExecutorSettings;

/// Lines of stderr (or stdout) kept for the failure message.
const OUTPUT_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Begin,
    Processing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Status(PipelineStatus),
    Progress { done: usize, total: usize },
    Output(String),
}

pub fn parse_line(line: &str) -> PipelineEvent {
    let trimmed = line.trim();

    if let Some(status) = trimmed.strip_prefix("STATUS:") {
        match status.trim() {
            "BEGIN" => return PipelineEvent::Status(PipelineStatus::Begin),
            "PROCESSING" => return PipelineEvent::Status(PipelineStatus::Processing),
            "DONE" => return PipelineEvent::Status(PipelineStatus::Done),
            _ => {}
        }
    }

    if let Some(counts) = trimmed.strip_prefix("PROCESS:") {
        if let Some((done, total)) = counts.trim().split_once('/') {
            if let (Ok(done), Ok(total)) = (done.trim().parse(), total.trim().parse()) {
                return PipelineEvent::Progress { done, total };
            }
        }
    }

    PipelineEvent::Output(trimmed.to_string())
}

/// How to launch the external pipeline.
#[derive(Debug, Clone)]
pub struct PipelineCommand {
    program: String,
    args: Vec<String>,
}

impl PipelineCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self::new(settings.program.clone(), settings.program_args.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the pipeline with `task_args` appended and feeds every stdout
    /// line to `on_event`. The child is killed if `cancel` fires.
    pub async fn run<F>(
        &self,
        task_args: &[OsString],
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut(PipelineEvent),
    {
        info!("Launching pipeline {} {:?}", self.program, task_args);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(task_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_error(std::io::Error::other("stdout was not captured")))?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(stderr, OUTPUT_TAIL_LINES)));

        let mut stdout_tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancel requested, stopping pipeline");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill pipeline process: {}", e);
                    }
                    return Err(TaskError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let event = parse_line(&line);
                        if let PipelineEvent::Output(text) = &event {
                            debug!(target: "rewildid::pipeline::stdout", "{}", text);
                            push_tail(&mut stdout_tail, text.clone(), OUTPUT_TAIL_LINES);
                        }
                        on_event(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read pipeline output: {}", e);
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill pipeline process: {}", e);
                }
                return Err(TaskError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| self.spawn_error(e))?,
        };

        let stderr_tail = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if status.success() {
            return Ok(());
        }

        let tail = if stderr_tail.is_empty() {
            stdout_tail
        } else {
            stderr_tail
        };
        let detail = if tail.is_empty() {
            "no output".to_string()
        } else {
            Vec::from(tail).join("\n")
        };
        Err(TaskError::PipelineExit {
            status: status.to_string(),
            detail,
        })
    }

    fn spawn_error(&self, source: std::io::Error) -> TaskError {
        TaskError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String, limit: usize) {
    if line.is_empty() {
        return;
    }
    if tail.len() == limit {
        tail.pop_front();
    }
    tail.push_back(line);
}

async fn collect_tail<R>(reader: R, limit: usize) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(limit);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "rewildid::pipeline::stderr", "{}", line);
        push_tail(&mut tail, line.trim().to_string(), limit);
    }
    tail
}
