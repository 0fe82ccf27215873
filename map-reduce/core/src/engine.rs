// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSettings, JobProgress};
use crate::error::{ConfigError, JobError, JobResult};
use crate::input_split::InputSplit;
use crate::intermediate_store::IntermediateStore;
use crate::job::{JobStatus, MapReduceJob};
use crate::output::{JobOutput, OutputAssembler, OutputCommitter};
use crate::partitioner::{HashPartitioner, Partitioner};
use crate::shutdown_signal::TokenShutdownSignal;
use crate::task_channel::{LocalTaskChannel, TaskChannel};
use crate::worker::{FaultInjection, Worker, WorkerContext};
use crate::worker_pool::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Runs map/reduce jobs with the workers and limits of one configuration
pub struct MapReduceEngine {
    config: Config,
    partitioner: Arc<dyn Partitioner>,
}

impl MapReduceEngine {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            partitioner: Arc::new(HashPartitioner),
        })
    }

    /// Replaces the default hash partitioner
    pub fn with_partitioner(mut self, partitioner: impl Partitioner) -> Self {
        self.partitioner = Arc::new(partitioner);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts `job` over `splits`, one map task per split
    ///
    /// Fails before starting anything if the job is malformed or
    /// `output_dir` already holds data.
    pub async fn submit<J, S, I>(
        &self,
        job: J,
        splits: Vec<I>,
        store: S,
        output_dir: impl Into<PathBuf>,
    ) -> JobResult<JobHandle>
    where
        J: MapReduceJob,
        S: IntermediateStore<J::Value>,
        I: InputSplit,
    {
        self.submit_with_channel(job, splits, store, output_dir, LocalTaskChannel::new)
            .await
    }

    /// Like [`submit`](Self::submit), with workers talking to the
    /// coordinator through the channel built by `make_channel`
    pub async fn submit_with_channel<J, S, I, C>(
        &self,
        job: J,
        splits: Vec<I>,
        store: S,
        output_dir: impl Into<PathBuf>,
        make_channel: impl FnOnce(Arc<Coordinator>) -> C,
    ) -> JobResult<JobHandle>
    where
        J: MapReduceJob,
        S: IntermediateStore<J::Value>,
        I: InputSplit,
        C: TaskChannel,
    {
        let coordinator = Arc::new(Coordinator::new(
            splits.len(),
            self.config.num_reduce_partitions,
            CoordinatorSettings::from(&self.config),
        )?);
        let committer = OutputCommitter::prepare(output_dir).await?;

        info!(
            "Submitting job: {} map tasks, {} reduce partitions, {} workers -> {}",
            splits.len(),
            self.config.num_reduce_partitions,
            self.config.num_workers,
            committer.dir().display()
        );

        let splits: Arc<[Arc<dyn InputSplit>]> = splits
            .into_iter()
            .map(|split| Arc::new(split) as Arc<dyn InputSplit>)
            .collect();
        let ctx = WorkerContext {
            job: Arc::new(job),
            splits,
            store: store.clone(),
            output: committer.clone(),
            partitioner: self.partitioner.clone(),
            faults: FaultInjection::from(&self.config),
            poll_interval: self.config.poll_interval(),
        };

        let channel = make_channel(coordinator.clone());
        let shutdown = TokenShutdownSignal::default();
        let factory = {
            let shutdown = shutdown.clone();
            move |id| Worker::new(id, ctx.clone(), channel.clone(), shutdown.clone()).run()
        };
        let pool = WorkerPool::spawn(self.config.num_workers, factory, shutdown);

        let monitor = tokio::spawn(monitor_job::<J::Value, S>(
            coordinator.clone(),
            pool,
            committer,
            store,
            self.config.monitor_interval(),
        ));

        Ok(JobHandle {
            coordinator,
            monitor,
        })
    }

    /// Submits `job` and waits for its outcome
    pub async fn run<J, S, I>(
        &self,
        job: J,
        splits: Vec<I>,
        store: S,
        output_dir: impl Into<PathBuf>,
    ) -> JobResult<JobOutput>
    where
        J: MapReduceJob,
        S: IntermediateStore<J::Value>,
        I: InputSplit,
    {
        self.submit(job, splits, store, output_dir).await?.wait().await
    }
}

/// Drives timeout detection until every task is settled, then commits the
/// output and tears the job down
async fn monitor_job<V, S>(
    coordinator: Arc<Coordinator>,
    pool: WorkerPool,
    committer: OutputCommitter,
    store: S,
    interval: Duration,
) -> JobResult<JobOutput>
where
    V: Send + 'static,
    S: IntermediateStore<V>,
{
    let started = Instant::now();
    let mut status_rx = coordinator.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let terminal = status_rx.borrow_and_update().is_terminal();
        if terminal || coordinator.is_committing() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                coordinator.check_timeouts(Instant::now());
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Workers are gone before the output directory is touched
    let summary = pool.shutdown().await;

    let result = if coordinator.is_committing() {
        let assembled = match coordinator.committed_segments() {
            Ok(segments) => {
                OutputAssembler::assemble(&committer, &segments, coordinator.num_partitions())
                    .await
            }
            Err(err) => Err(err),
        };
        // The job only counts as succeeded once its output is in place
        let outcome = assembled.as_ref().map(|_| ()).map_err(Clone::clone);
        coordinator.finish_commit(outcome);
        assembled
    } else {
        Err(coordinator.failure().unwrap_or(JobError::Cancelled))
    };

    if result.is_err() {
        if let Err(err) = committer.abort().await {
            warn!("Failed to remove staged output: {}", err);
        }
    }
    if let Err(err) = store.clear().await {
        warn!("Failed to clear intermediate data: {}", err);
    }

    let progress = coordinator.progress();
    info!(
        "Job {:?} after {:.2?}: {} failed attempts, {} workers spawned ({} crashed)",
        coordinator.status(),
        started.elapsed(),
        progress.failed_attempts,
        summary.spawned,
        summary.crashed
    );
    result
}

/// Control handle of one submitted job
pub struct JobHandle {
    coordinator: Arc<Coordinator>,
    monitor: JoinHandle<JobResult<JobOutput>>,
}

impl JobHandle {
    pub fn status(&self) -> JobStatus {
        self.coordinator.status()
    }

    pub fn progress(&self) -> JobProgress {
        self.coordinator.progress()
    }

    /// Stops the job; no segment is committed afterwards. Returns false if
    /// the job had already finished or is committing its output.
    pub fn cancel(&self) -> bool {
        let cancelled = self.coordinator.cancel();
        if cancelled {
            info!("Job cancelled");
        }
        cancelled
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Waits for the job to finish and returns its output or the error that
    /// ended it
    pub async fn wait(self) -> JobResult<JobOutput> {
        self.monitor
            .await
            .map_err(|e| JobError::TaskExecution(format!("job monitor aborted: {}", e)))?
    }
}
