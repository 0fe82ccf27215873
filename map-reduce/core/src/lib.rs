// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

mod config;
pub use config::Config;

mod error;
pub use error::{ConfigError, ExhaustedTask, JobError, JobResult};

mod job;
pub use job::{FnJob, JobStatus, MapReduceJob};

pub mod task;
pub use task::{
    AssignedWork, FailureKind, Task, TaskAssignment, TaskFailure, TaskId, TaskKind, TaskOutcome,
    TaskOutput, TaskReport, TaskStatus, WorkerId,
};

mod partitioner;
pub use partitioner::{HashPartitioner, Partitioner};

mod input_split;
pub use input_split::{split_files, split_lines, FileSplit, InputSplit, LineSplit, Records};

mod intermediate_store;
pub use intermediate_store::{
    group_by_key, BufferLocation, FileIntermediateStore, InMemoryIntermediateStore,
    IntermediateStore,
};

mod output;
pub use output::{
    segment_file_name, JobOutput, OutputAssembler, OutputCommitter, SegmentLocation,
    SUCCESS_MARKER,
};

mod coordinator;
pub use coordinator::{Coordinator, CoordinatorSettings, JobProgress, ReportAck, TaskResponse};

mod task_channel;
pub use task_channel::{LocalTaskChannel, TaskChannel};

mod shutdown_signal;
pub use shutdown_signal::{ShutdownSignal, TokenShutdownSignal};

mod worker;
pub use worker::{run_map, run_reduce, FaultConfig, FaultInjection, Worker, WorkerContext, WorkerExit};

mod worker_pool;
pub use worker_pool::{PoolSummary, WorkerFactory, WorkerPool};

mod engine;
pub use engine::{JobHandle, MapReduceEngine};

pub mod telemetry;
