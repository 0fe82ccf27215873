// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::config::Config;
use crate::coordinator::{ReportAck, TaskResponse};
use crate::error::{JobError, JobResult};
use crate::input_split::InputSplit;
use crate::intermediate_store::{group_by_key, BufferLocation, IntermediateStore};
use crate::job::MapReduceJob;
use crate::output::OutputCommitter;
use crate::partitioner::Partitioner;
use crate::shutdown_signal::ShutdownSignal;
use crate::task::{
    AssignedWork, FailureKind, TaskAssignment, TaskFailure, TaskId, TaskOutcome, TaskOutput,
    TaskReport, WorkerId,
};
use crate::task_channel::TaskChannel;
use rand::Rng;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for fault injection in one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultConfig {
    pub failure_probability: u32,
    pub straggler_probability: u32,
    pub straggler_delay_ms: u64,
}

/// Fault injection for both phases plus silent crashes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultInjection {
    pub map: FaultConfig,
    pub reduce: FaultConfig,
    pub crash_probability: u32,
}

impl From<&Config> for FaultInjection {
    fn from(config: &Config) -> Self {
        Self {
            map: FaultConfig {
                failure_probability: config.mapper_failure_probability,
                straggler_probability: config.mapper_straggler_probability,
                straggler_delay_ms: config.mapper_straggler_delay_ms,
            },
            reduce: FaultConfig {
                failure_probability: config.reducer_failure_probability,
                straggler_probability: config.reducer_straggler_probability,
                straggler_delay_ms: config.reducer_straggler_delay_ms,
            },
            crash_probability: config.worker_crash_probability,
        }
    }
}

fn roll(probability: u32) -> bool {
    probability > 0 && rand::rng().random_range(0..100) < probability
}

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The job reached a terminal state
    Finished,
    /// Shutdown was requested
    Shutdown,
    /// Died while holding a task, without reporting
    Crashed,
}

/// Everything a worker needs to execute tasks, shared by the whole pool
pub struct WorkerContext<J: MapReduceJob, S> {
    pub job: Arc<J>,
    pub splits: Arc<[Arc<dyn InputSplit>]>,
    pub store: S,
    pub output: OutputCommitter,
    pub partitioner: Arc<dyn Partitioner>,
    pub faults: FaultInjection,
    pub poll_interval: Duration,
}

impl<J: MapReduceJob, S: Clone> Clone for WorkerContext<J, S> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            splits: self.splits.clone(),
            store: self.store.clone(),
            output: self.output.clone(),
            partitioner: self.partitioner.clone(),
            faults: self.faults,
            poll_interval: self.poll_interval,
        }
    }
}

/// Pulls tasks from the coordinator, runs them and reports the outcome
///
/// A worker keeps no recovery state: if it dies mid-task the coordinator's
/// timeout scan re-queues the task.
pub struct Worker<J: MapReduceJob, S, C, SD> {
    id: WorkerId,
    ctx: WorkerContext<J, S>,
    channel: C,
    shutdown: SD,
}

impl<J, S, C, SD> Worker<J, S, C, SD>
where
    J: MapReduceJob,
    S: IntermediateStore<J::Value>,
    C: TaskChannel,
    SD: ShutdownSignal,
{
    pub fn new(id: WorkerId, ctx: WorkerContext<J, S>, channel: C, shutdown: SD) -> Self {
        Self {
            id,
            ctx,
            channel,
            shutdown,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub async fn run(self) -> WorkerExit {
        loop {
            if self.shutdown.is_cancelled() {
                return WorkerExit::Shutdown;
            }

            let response = tokio::select! {
                _ = self.shutdown.cancelled() => return WorkerExit::Shutdown,
                response = self.channel.request_task(self.id) => response,
            };

            match response {
                TaskResponse::Done(status) => {
                    debug!(worker_id = self.id, ?status, "worker finished");
                    return WorkerExit::Finished;
                }
                TaskResponse::Wait => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return WorkerExit::Shutdown,
                        _ = tokio::time::sleep(self.ctx.poll_interval) => {}
                    }
                }
                TaskResponse::Assigned(assignment) => {
                    let outcome = tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            debug!(worker_id = self.id, task_id = assignment.task_id, "abandoning task");
                            return WorkerExit::Shutdown;
                        }
                        outcome = self.attempt(&assignment) => outcome,
                    };
                    let Some(outcome) = outcome else {
                        return WorkerExit::Crashed;
                    };
                    self.report(&assignment, outcome).await;
                }
            }
        }
    }

    /// Runs one attempt. `None` means the worker crashed and must not report.
    async fn attempt(&self, assignment: &TaskAssignment) -> Option<TaskOutcome> {
        let faults = match assignment.work {
            AssignedWork::Map { .. } => self.ctx.faults.map,
            AssignedWork::Reduce { .. } => self.ctx.faults.reduce,
        };

        if roll(self.ctx.faults.crash_probability) {
            warn!(
                "💀 Worker {} crashed while holding task {}",
                self.id, assignment.task_id
            );
            return None;
        }

        if roll(faults.straggler_probability) {
            let delay = rand::rng().random_range(1..=faults.straggler_delay_ms.max(1));
            warn!(
                "🐌 Worker {} is a straggler on task {}! Delaying {}ms",
                self.id, assignment.task_id, delay
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if roll(faults.failure_probability) {
            warn!(
                "💥 Worker {} simulated failure on task {}",
                self.id, assignment.task_id
            );
            return Some(TaskOutcome::Failure(TaskFailure::new(
                FailureKind::TaskExecution,
                "simulated failure",
            )));
        }

        let result = match &assignment.work {
            AssignedWork::Map {
                split,
                num_partitions,
            } => {
                self.execute_map(assignment.task_id, assignment.attempt, *split, *num_partitions)
                    .await
            }
            AssignedWork::Reduce { partition, inputs } => {
                self.execute_reduce(assignment.attempt, *partition, inputs)
                    .await
            }
        };

        Some(match result {
            Ok(output) => TaskOutcome::Success(output),
            Err(err) => TaskOutcome::Failure(TaskFailure::from(&err)),
        })
    }

    async fn execute_map(
        &self,
        task_id: TaskId,
        attempt: u32,
        split: usize,
        num_partitions: usize,
    ) -> JobResult<TaskOutput> {
        let input = self
            .ctx
            .splits
            .get(split)
            .cloned()
            .ok_or_else(|| JobError::InvalidJob(format!("unknown input split {}", split)))?;
        let job = self.ctx.job.clone();
        let partitioner = self.ctx.partitioner.clone();

        let buckets = tokio::task::spawn_blocking(move || {
            run_map(job.as_ref(), input.as_ref(), partitioner.as_ref(), num_partitions)
        })
        .await
        .map_err(|e| JobError::TaskExecution(format!("map task aborted: {}", e)))??;

        // Store I/O happens here, outside any coordinator lock
        let mut locations = Vec::with_capacity(num_partitions);
        for (partition, records) in buckets.into_iter().enumerate() {
            let location = self
                .ctx
                .store
                .write_partition(task_id, attempt, partition, records)
                .await?;
            locations.push(location);
        }
        Ok(TaskOutput::Map(locations))
    }

    async fn execute_reduce(
        &self,
        attempt: u32,
        partition: usize,
        inputs: &[BufferLocation],
    ) -> JobResult<TaskOutput> {
        let records = self.ctx.store.read_partition(partition, inputs).await?;
        let job = self.ctx.job.clone();

        let segment = tokio::task::spawn_blocking(move || run_reduce(job.as_ref(), records))
            .await
            .map_err(|e| JobError::TaskExecution(format!("reduce task aborted: {}", e)))??;

        let location = self
            .ctx
            .output
            .write_segment(partition, attempt, &segment)
            .await?;
        Ok(TaskOutput::Reduce(location))
    }

    async fn report(&self, assignment: &TaskAssignment, outcome: TaskOutcome) {
        let succeeded = matches!(outcome, TaskOutcome::Success(_));
        let ack = self
            .channel
            .report_task_result(TaskReport {
                task_id: assignment.task_id,
                worker_id: self.id,
                attempt: assignment.attempt,
                outcome,
            })
            .await;

        match ack {
            ReportAck::Accepted if succeeded => {
                debug!(
                    worker_id = self.id,
                    task_id = assignment.task_id,
                    "finished work"
                );
            }
            ReportAck::Accepted => {}
            ReportAck::Stale | ReportAck::Terminal => {
                info!(
                    "Worker {} discarded result of task {} attempt {} ({:?})",
                    self.id, assignment.task_id, assignment.attempt, ack
                );
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Applies the map function to every record of `input` and buckets the
/// pairs by partition
pub fn run_map<J: MapReduceJob>(
    job: &J,
    input: &dyn InputSplit,
    partitioner: &dyn Partitioner,
    num_partitions: usize,
) -> JobResult<Vec<Vec<(String, J::Value)>>> {
    let mut buckets: Vec<Vec<(String, J::Value)>> =
        (0..num_partitions).map(|_| Vec::new()).collect();

    for record in input.open()? {
        let record = record.map_err(|e| JobError::InputUnreadable {
            source_name: input.describe(),
            message: e.to_string(),
        })?;
        let pairs = catch_unwind(AssertUnwindSafe(|| job.map(&record)))
            .map_err(|p| JobError::TaskExecution(format!("map panicked: {}", panic_message(p))))?
            .map_err(|e| JobError::TaskExecution(format!("map failed: {:#}", e)))?;

        for (key, value) in pairs {
            if key.contains(['\t', '\n', '\r']) {
                return Err(JobError::TaskExecution(format!(
                    "map emitted key {:?}; keys may not contain tabs or line breaks",
                    key
                )));
            }
            let partition = partitioner.partition(&key, num_partitions);
            let bucket = buckets.get_mut(partition).ok_or_else(|| {
                JobError::TaskExecution(format!(
                    "partitioner returned {} for {} partitions",
                    partition, num_partitions
                ))
            })?;
            bucket.push((key, value));
        }
    }
    Ok(buckets)
}

/// Groups `records` by key and folds each group, keys in sorted order
pub fn run_reduce<J: MapReduceJob>(
    job: &J,
    records: Vec<(String, J::Value)>,
) -> JobResult<Vec<(String, String)>> {
    group_by_key(records)
        .into_iter()
        .map(|(key, values)| {
            let aggregate = catch_unwind(AssertUnwindSafe(|| job.reduce(&key, values)))
                .map_err(|p| {
                    JobError::TaskExecution(format!("reduce panicked: {}", panic_message(p)))
                })?
                .map_err(|e| JobError::TaskExecution(format!("reduce failed on {}: {:#}", key, e)))?;
            let rendered = aggregate.to_string();
            if rendered.contains(['\n', '\r']) {
                return Err(JobError::TaskExecution(format!(
                    "reduce output for {} spans several lines: {:?}",
                    key, rendered
                )));
            }
            Ok((key, rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_split::{FileSplit, LineSplit};
    use crate::job::FnJob;
    use crate::partitioner::HashPartitioner;

    fn words(line: &str) -> anyhow::Result<Vec<(String, u64)>> {
        Ok(line.split_whitespace().map(|w| (w.to_string(), 1)).collect())
    }

    fn sum(_key: &str, values: Vec<u64>) -> anyhow::Result<u64> {
        Ok(values.into_iter().sum())
    }

    #[test]
    fn test_map_buckets_every_pair_by_partition() {
        let job = FnJob::new(words, sum);
        let split = LineSplit::new(vec!["a b c".into(), "a d".into()]);
        let buckets = run_map(&job, &split, &HashPartitioner, 3).unwrap();

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), 5);
        for (partition, bucket) in buckets.iter().enumerate() {
            for (key, _) in bucket {
                assert_eq!(HashPartitioner.partition(key, 3), partition);
            }
        }
    }

    #[test]
    fn test_map_error_is_a_task_failure() {
        let job = FnJob::new(
            |_: &str| -> anyhow::Result<Vec<(String, u64)>> { anyhow::bail!("bad record") },
            sum,
        );
        let split = LineSplit::new(vec!["x".into()]);
        let err = run_map(&job, &split, &HashPartitioner, 1).unwrap_err();
        assert!(matches!(err, JobError::TaskExecution(ref m) if m.contains("bad record")));
        assert_eq!(TaskFailure::from(&err).kind, FailureKind::TaskExecution);
    }

    #[test]
    fn test_map_rejects_keys_that_break_segment_lines() {
        for key in ["tab\there", "two\nlines", "cr\r"] {
            let job = FnJob::new(
                move |_: &str| -> anyhow::Result<Vec<(String, u64)>> {
                    Ok(vec![(key.to_string(), 1)])
                },
                sum,
            );
            let split = LineSplit::new(vec!["x".into()]);
            let err = run_map(&job, &split, &HashPartitioner, 2).unwrap_err();
            assert!(matches!(err, JobError::TaskExecution(_)), "{:?} accepted", key);
        }
    }

    #[test]
    fn test_missing_input_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let split = FileSplit::new(vec![dir.path().join("gone.txt")]);
        let err = run_map(&FnJob::new(words, sum), &split, &HashPartitioner, 1).unwrap_err();
        assert!(matches!(err, JobError::InputUnreadable { .. }));
        assert_eq!(TaskFailure::from(&err).kind, FailureKind::InputUnreadable);
    }

    #[test]
    fn test_reduce_emits_sorted_aggregates() {
        let records = vec![
            ("b".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 3),
        ];
        let segment = run_reduce(&FnJob::new(words, sum), records).unwrap();
        assert_eq!(
            segment,
            vec![
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "4".to_string())
            ]
        );
    }

    #[test]
    fn test_reduce_rejects_multi_line_output() {
        let job = FnJob::new(words, |key: &str, _: Vec<u64>| -> anyhow::Result<String> {
            Ok(format!("{}\nforged\t1", key))
        });
        let err = run_reduce(&job, vec![("a".to_string(), 1)]).unwrap_err();
        assert!(matches!(err, JobError::TaskExecution(ref m) if m.contains("several lines")));
    }
}
