// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::JobError;
use crate::intermediate_store::BufferLocation;
use crate::output::SegmentLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::{Duration, Instant};

pub type TaskId = usize;
pub type WorkerId = usize;

/// What a task works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Map over the input split with this index
    Map { split: usize },
    /// Reduce the partition with this index
    Reduce { partition: usize },
}

impl TaskKind {
    pub fn is_map(&self) -> bool {
        matches!(self, TaskKind::Map { .. })
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Map { split } => write!(f, "map split {}", split),
            TaskKind::Reduce { partition } => write!(f, "reduce partition {}", partition),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    InputUnreadable,
    WorkerTimeout,
    TaskExecution,
    Storage,
}

/// Failure reported for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&JobError> for TaskFailure {
    fn from(err: &JobError) -> Self {
        let kind = match err {
            JobError::InputUnreadable { .. } => FailureKind::InputUnreadable,
            JobError::WorkerTimeout { .. } => FailureKind::WorkerTimeout,
            JobError::Storage(_) | JobError::Io { .. } | JobError::OutputConflict { .. } => {
                FailureKind::Storage
            }
            _ => FailureKind::TaskExecution,
        };
        TaskFailure::new(kind, err.to_string())
    }
}

/// Work handed to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub attempt: u32,
    pub work: AssignedWork,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignedWork {
    Map {
        split: usize,
        num_partitions: usize,
    },
    /// `inputs` names the committed buffer of every map task for this partition
    Reduce {
        partition: usize,
        inputs: Vec<BufferLocation>,
    },
}

/// What a successful attempt produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutput {
    Map(Vec<BufferLocation>),
    Reduce(SegmentLocation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(TaskOutput),
    Failure(TaskFailure),
}

/// Attempt outcome sent back by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

/// Result of a failed or expired attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailTransition {
    /// Back to Idle, another attempt is allowed
    Requeued,
    /// Attempts exhausted, task is Failed
    Exhausted,
    /// The attempt was no longer the current assignment
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    worker_id: WorkerId,
    attempt: u32,
    started_at: Instant,
}

/// One unit of work plus its lifecycle state, owned by the coordinator
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    status: TaskStatus,
    assignment: Option<Assignment>,
    attempts: u32,
    last_failure: Option<TaskFailure>,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            status: TaskStatus::Idle,
            assignment: None,
            attempts: 0,
            last_failure: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.assignment.map(|a| a.worker_id)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.assignment.map(|a| a.started_at)
    }

    pub fn last_failure(&self) -> Option<&TaskFailure> {
        self.last_failure.as_ref()
    }

    /// Idle -> InProgress. Returns the new attempt number
    pub fn assign(&mut self, worker_id: WorkerId, now: Instant) -> Option<u32> {
        if self.status != TaskStatus::Idle {
            return None;
        }
        self.attempts += 1;
        self.status = TaskStatus::InProgress;
        self.assignment = Some(Assignment {
            worker_id,
            attempt: self.attempts,
            started_at: now,
        });
        Some(self.attempts)
    }

    /// True when `worker_id`/`attempt` is the live assignment
    pub fn is_current(&self, worker_id: WorkerId, attempt: u32) -> bool {
        self.status == TaskStatus::InProgress
            && self
                .assignment
                .is_some_and(|a| a.worker_id == worker_id && a.attempt == attempt)
    }

    /// InProgress -> Completed, only for the live assignment
    pub fn complete(&mut self, worker_id: WorkerId, attempt: u32) -> bool {
        if !self.is_current(worker_id, attempt) {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.assignment = None;
        true
    }

    pub fn fail(
        &mut self,
        worker_id: WorkerId,
        attempt: u32,
        failure: TaskFailure,
        max_attempts: u32,
    ) -> FailTransition {
        if !self.is_current(worker_id, attempt) {
            return FailTransition::Stale;
        }
        self.release(failure, max_attempts)
    }

    /// Treats an attempt older than `timeout` as failed
    pub fn expire(
        &mut self,
        now: Instant,
        timeout: Duration,
        max_attempts: u32,
    ) -> Option<FailTransition> {
        let assignment = self.assignment?;
        if self.status != TaskStatus::InProgress
            || now.saturating_duration_since(assignment.started_at) <= timeout
        {
            return None;
        }
        let err = JobError::WorkerTimeout {
            task_id: self.id,
            worker_id: assignment.worker_id,
        };
        Some(self.release(TaskFailure::from(&err), max_attempts))
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Cancelled;
            self.assignment = None;
        }
    }

    fn release(&mut self, failure: TaskFailure, max_attempts: u32) -> FailTransition {
        self.assignment = None;
        self.last_failure = Some(failure);
        if self.attempts >= max_attempts {
            self.status = TaskStatus::Failed;
            FailTransition::Exhausted
        } else {
            self.status = TaskStatus::Idle;
            FailTransition::Requeued
        }
    }
}
