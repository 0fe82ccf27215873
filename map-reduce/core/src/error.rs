// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::task::{FailureKind, TaskId, TaskKind};
use std::fmt;
use std::path::PathBuf;

/// Last failure recorded for a task that ran out of attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExhaustedTask {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub attempts: u32,
    pub last_failure: FailureKind,
    pub message: String,
}

impl fmt::Display for ExhaustedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} ({}) after {} attempts: {:?}: {}",
            self.task_id, self.kind, self.attempts, self.last_failure, self.message
        )
    }
}

/// Errors surfaced to the caller of a job
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Input unreadable ({source_name}): {message}")]
    InputUnreadable { source_name: String, message: String },

    #[error("Task {task_id} timed out on worker {worker_id}")]
    WorkerTimeout { task_id: TaskId, worker_id: usize },

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Output destination {} already exists and is not empty", .path.display())]
    OutputConflict { path: PathBuf },

    #[error("Retry ceiling exceeded: {}", format_exhausted(.0))]
    RetryCeilingExceeded(Vec<ExhaustedTask>),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error on {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

impl JobError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

fn format_exhausted(tasks: &[ExhaustedTask]) -> String {
    tasks
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type JobResult<T> = Result<T, JobError>;
