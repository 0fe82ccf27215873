// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::config::Config;
use crate::error::{ExhaustedTask, JobError, JobResult};
use crate::intermediate_store::BufferLocation;
use crate::job::JobStatus;
use crate::output::SegmentLocation;
use crate::task::{
    AssignedWork, FailTransition, FailureKind, Task, TaskAssignment, TaskFailure, TaskId,
    TaskKind, TaskOutcome, TaskOutput, TaskReport, TaskStatus, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Scheduling parameters of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// `None` disables timeout detection
    pub task_timeout: Option<Duration>,
    pub max_attempts: u32,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            max_attempts: config.max_attempts,
        }
    }
}

/// Answer to a worker asking for work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResponse {
    Assigned(TaskAssignment),
    /// Nothing idle right now, ask again later
    Wait,
    /// The job reached a terminal state
    Done(JobStatus),
}

/// Answer to a worker reporting an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportAck {
    Accepted,
    /// The attempt was superseded; its result was discarded
    Stale,
    /// The job is already over; the result was discarded
    Terminal,
}

/// Task counts at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub maps_total: usize,
    pub maps_completed: usize,
    pub reduces_total: usize,
    pub reduces_completed: usize,
    pub in_progress: usize,
    pub failed_attempts: u32,
}

struct CoordinatorState {
    status: JobStatus,
    tasks: Vec<Task>,
    map_outputs: Vec<Option<Vec<BufferLocation>>>,
    segments: Vec<Option<SegmentLocation>>,
    maps_completed: usize,
    reduces_completed: usize,
    failed_attempts: u32,
    failure: Option<JobError>,
    /// Every reduce is done; the status waits on the output commit
    committing: bool,
}

/// Single scheduling authority of a job
///
/// Every task transition goes through the one mutex around the task table.
/// Callers never hold that lock across I/O or user code.
pub struct Coordinator {
    num_maps: usize,
    num_partitions: usize,
    settings: CoordinatorSettings,
    state: Mutex<CoordinatorState>,
    status_tx: watch::Sender<JobStatus>,
}

impl Coordinator {
    /// Creates one map task per split and one reduce task per partition
    pub fn new(
        num_splits: usize,
        num_partitions: usize,
        settings: CoordinatorSettings,
    ) -> JobResult<Self> {
        if num_splits == 0 {
            return Err(JobError::InvalidJob("at least one map task is required".into()));
        }
        if num_partitions == 0 {
            return Err(JobError::InvalidJob(
                "at least one reduce partition is required".into(),
            ));
        }
        if settings.max_attempts == 0 {
            return Err(JobError::InvalidJob("max_attempts must be at least 1".into()));
        }

        let tasks = (0..num_splits)
            .map(|split| Task::new(split, TaskKind::Map { split }))
            .chain((0..num_partitions).map(|partition| {
                Task::new(num_splits + partition, TaskKind::Reduce { partition })
            }))
            .collect();

        let (status_tx, _) = watch::channel(JobStatus::Pending);
        Ok(Self {
            num_maps: num_splits,
            num_partitions,
            settings,
            state: Mutex::new(CoordinatorState {
                status: JobStatus::Pending,
                tasks,
                map_outputs: vec![None; num_splits],
                segments: vec![None; num_partitions],
                maps_completed: 0,
                reduces_completed: 0,
                failed_attempts: 0,
                failure: None,
                committing: false,
            }),
            status_tx,
        })
    }

    pub fn num_maps(&self) -> usize {
        self.num_maps
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands an idle task to `worker_id`. Map tasks first; reduce tasks only
    /// once every map task is completed.
    pub fn request_task(&self, worker_id: WorkerId) -> TaskResponse {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return TaskResponse::Done(state.status);
        }
        if state.committing {
            return TaskResponse::Wait;
        }

        let barrier_released = state.maps_completed == self.num_maps;
        let candidate = if barrier_released {
            state.tasks[self.num_maps..]
                .iter()
                .position(|t| t.status() == TaskStatus::Idle)
                .map(|offset| self.num_maps + offset)
        } else {
            state.tasks[..self.num_maps]
                .iter()
                .position(|t| t.status() == TaskStatus::Idle)
        };
        let Some(task_id) = candidate else {
            return TaskResponse::Wait;
        };

        let work = match state.tasks[task_id].kind() {
            TaskKind::Map { split } => AssignedWork::Map {
                split,
                num_partitions: self.num_partitions,
            },
            TaskKind::Reduce { partition } => AssignedWork::Reduce {
                partition,
                inputs: Self::partition_inputs(&state, partition),
            },
        };

        let Some(attempt) = state.tasks[task_id].assign(worker_id, Instant::now()) else {
            return TaskResponse::Wait;
        };
        if state.status == JobStatus::Pending {
            state.status = JobStatus::Running;
            self.status_tx.send_replace(JobStatus::Running);
            info!("=== MAP PHASE ===");
        }

        debug!(
            task_id,
            attempt,
            worker_id,
            "assigned {}",
            state.tasks[task_id].kind()
        );
        TaskResponse::Assigned(TaskAssignment {
            task_id,
            attempt,
            work,
        })
    }

    fn partition_inputs(state: &CoordinatorState, partition: usize) -> Vec<BufferLocation> {
        state
            .map_outputs
            .iter()
            .flatten()
            .filter_map(|locations| locations.iter().find(|l| l.partition == partition))
            .cloned()
            .collect()
    }

    /// Applies the outcome of one attempt. Reports from superseded attempts
    /// are acknowledged as `Stale` and change nothing.
    pub fn report_task_result(&self, report: TaskReport) -> ReportAck {
        let TaskReport {
            task_id,
            worker_id,
            attempt,
            outcome,
        } = report;

        let mut state = self.lock();
        if state.status.is_terminal() || state.committing {
            return ReportAck::Terminal;
        }
        let Some(task) = state.tasks.get(task_id) else {
            warn!("Report for unknown task {} ignored", task_id);
            return ReportAck::Stale;
        };
        if !task.is_current(worker_id, attempt) {
            debug!(
                task_id,
                attempt, worker_id, "ignoring report from superseded attempt"
            );
            return ReportAck::Stale;
        }
        let kind = task.kind();

        match outcome {
            TaskOutcome::Success(output) => {
                if let Err(message) = self.validate_output(kind, &output) {
                    let failure = TaskFailure::from(&JobError::Storage(message));
                    return self.apply_failure(&mut state, task_id, worker_id, attempt, failure);
                }
                state.tasks[task_id].complete(worker_id, attempt);
                self.record_output(&mut state, kind, output);
                ReportAck::Accepted
            }
            TaskOutcome::Failure(failure) => {
                self.apply_failure(&mut state, task_id, worker_id, attempt, failure)
            }
        }
    }

    fn validate_output(&self, kind: TaskKind, output: &TaskOutput) -> Result<(), String> {
        match (kind, output) {
            (TaskKind::Map { .. }, TaskOutput::Map(locations)) => {
                let mut seen = vec![false; self.num_partitions];
                for location in locations {
                    match seen.get_mut(location.partition) {
                        Some(flag) if !*flag => *flag = true,
                        _ => return Err(format!("bad partition {}", location.partition)),
                    }
                }
                if seen.iter().all(|s| *s) {
                    Ok(())
                } else {
                    Err("map output is missing partitions".into())
                }
            }
            (TaskKind::Reduce { partition }, TaskOutput::Reduce(segment))
                if segment.partition == partition =>
            {
                Ok(())
            }
            _ => Err(format!("output does not match {}", kind)),
        }
    }

    fn record_output(&self, state: &mut CoordinatorState, kind: TaskKind, output: TaskOutput) {
        match (kind, output) {
            (TaskKind::Map { split }, TaskOutput::Map(locations)) => {
                state.map_outputs[split] = Some(locations);
                state.maps_completed += 1;
                if state.maps_completed == self.num_maps {
                    info!("All {} map tasks completed", self.num_maps);
                    info!("=== REDUCE PHASE ===");
                }
            }
            (TaskKind::Reduce { partition }, TaskOutput::Reduce(segment)) => {
                state.segments[partition] = Some(segment);
                state.reduces_completed += 1;
                if state.reduces_completed == self.num_partitions {
                    info!("All {} reduce tasks completed", self.num_partitions);
                    state.committing = true;
                    // Same status, but watchers wake up to run the commit
                    self.status_tx.send_replace(state.status);
                }
            }
            _ => {}
        }
    }

    fn apply_failure(
        &self,
        state: &mut CoordinatorState,
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        failure: TaskFailure,
    ) -> ReportAck {
        let task = &mut state.tasks[task_id];
        let message = failure.message.clone();
        match task.fail(worker_id, attempt, failure, self.settings.max_attempts) {
            FailTransition::Stale => ReportAck::Stale,
            FailTransition::Requeued => {
                warn!(
                    "Task {} ({}) attempt {} failed on worker {}: {}. Re-queued",
                    task_id,
                    task.kind(),
                    attempt,
                    worker_id,
                    message
                );
                state.failed_attempts += 1;
                ReportAck::Accepted
            }
            FailTransition::Exhausted => {
                state.failed_attempts += 1;
                self.exhaust(state, task_id);
                ReportAck::Accepted
            }
        }
    }

    /// Re-queues every in-progress task older than the configured timeout
    pub fn check_timeouts(&self, now: Instant) -> Vec<TaskId> {
        let Some(timeout) = self.settings.task_timeout else {
            return Vec::new();
        };
        let mut state = self.lock();
        if state.status.is_terminal() || state.committing {
            return Vec::new();
        }

        let mut expired = Vec::new();
        let mut exhausted = Vec::new();
        for task in state.tasks.iter_mut() {
            let worker = task.assigned_worker();
            match task.expire(now, timeout, self.settings.max_attempts) {
                Some(FailTransition::Requeued) => {
                    warn!(
                        "Task {} ({}) timed out on worker {:?}. Re-queued",
                        task.id(),
                        task.kind(),
                        worker
                    );
                    expired.push(task.id());
                }
                Some(FailTransition::Exhausted) => {
                    expired.push(task.id());
                    exhausted.push(task.id());
                }
                _ => {}
            }
        }
        state.failed_attempts += expired.len() as u32;
        for task_id in exhausted {
            self.exhaust(&mut state, task_id);
        }
        expired
    }

    fn exhaust(&self, state: &mut CoordinatorState, task_id: TaskId) {
        let task = &state.tasks[task_id];
        let last = task.last_failure().cloned().unwrap_or_else(|| {
            TaskFailure::new(FailureKind::TaskExecution, "unknown failure")
        });
        let exhausted = ExhaustedTask {
            task_id,
            kind: task.kind(),
            attempts: task.attempts(),
            last_failure: last.kind,
            message: last.message,
        };
        warn!("Task {} exhausted its attempts: {}", task_id, exhausted);

        let mut failures = match state.failure.take() {
            Some(JobError::RetryCeilingExceeded(failures)) => failures,
            _ => Vec::new(),
        };
        failures.push(exhausted);
        if state.status.is_terminal() {
            state.failure = Some(JobError::RetryCeilingExceeded(failures));
        } else {
            self.finish(
                state,
                JobStatus::Failed,
                Some(JobError::RetryCeilingExceeded(failures)),
            );
        }
    }

    fn finish(&self, state: &mut CoordinatorState, status: JobStatus, failure: Option<JobError>) {
        for task in state.tasks.iter_mut() {
            task.cancel();
        }
        state.status = status;
        state.failure = failure;
        state.committing = false;
        self.status_tx.send_replace(status);
        info!("Job finished: {:?}", status);
    }

    /// Cancels every non-terminal task. Returns false if the job was
    /// already over or is committing its output.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() || state.committing {
            return false;
        }
        self.finish(&mut state, JobStatus::Cancelled, Some(JobError::Cancelled));
        true
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// True once every reduce is done and until the commit outcome is in
    pub fn is_committing(&self) -> bool {
        self.lock().committing
    }

    /// Ends a committing job: `Succeeded` when the output was assembled,
    /// `Failed` with the assembly error otherwise. Returns false if the job
    /// was not committing.
    pub fn finish_commit(&self, outcome: Result<(), JobError>) -> bool {
        let mut state = self.lock();
        if !state.committing {
            return false;
        }
        match outcome {
            Ok(()) => self.finish(&mut state, JobStatus::Succeeded, None),
            Err(err) => {
                error!("Output commit failed: {}", err);
                self.finish(&mut state, JobStatus::Failed, Some(err));
            }
        }
        true
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    /// Error that ended the job, if it failed or was cancelled
    pub fn failure(&self) -> Option<JobError> {
        self.lock().failure.clone()
    }

    pub fn progress(&self) -> JobProgress {
        let state = self.lock();
        JobProgress {
            maps_total: self.num_maps,
            maps_completed: state.maps_completed,
            reduces_total: self.num_partitions,
            reduces_completed: state.reduces_completed,
            in_progress: state
                .tasks
                .iter()
                .filter(|t| t.status() == TaskStatus::InProgress)
                .count(),
            failed_attempts: state.failed_attempts,
        }
    }

    /// Copy of one task record
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Segments of every partition in partition order. Refuses unless every
    /// reduce task is done.
    pub fn committed_segments(&self) -> JobResult<Vec<SegmentLocation>> {
        let state = self.lock();
        if !state.committing && state.status != JobStatus::Succeeded {
            return Err(JobError::InvalidJob(format!(
                "segments are only available once every reduce is done (status {:?})",
                state.status
            )));
        }
        state
            .segments
            .iter()
            .enumerate()
            .map(|(partition, segment)| {
                segment.clone().ok_or_else(|| {
                    JobError::InvalidJob(format!("partition {} has no segment", partition))
                })
            })
            .collect()
    }
}
