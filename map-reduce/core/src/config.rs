// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Upper bound on the number of map tasks (M)
    pub num_map_tasks: usize,
    /// Number of reduce partitions and output segments (R)
    pub num_reduce_partitions: usize,
    pub num_workers: usize,
    /// Time an attempt may stay in progress before it is re-queued (0 = no timeout)
    pub task_timeout_ms: u64,
    /// Attempts allowed per task before the job fails
    pub max_attempts: u32,
    /// Back-off between task requests when no work is available
    pub poll_interval_ms: u64,
    /// Probability (0-100) that a mapper fails during execution
    pub mapper_failure_probability: u32,
    /// Probability (0-100) that a reducer fails during execution
    pub reducer_failure_probability: u32,
    /// Probability (0-100) that a mapper becomes a straggler (slow)
    pub mapper_straggler_probability: u32,
    /// Maximum delay in milliseconds for a mapper straggler
    pub mapper_straggler_delay_ms: u64,
    /// Probability (0-100) that a reducer becomes a straggler (slow)
    pub reducer_straggler_probability: u32,
    /// Maximum delay in milliseconds for a reducer straggler
    pub reducer_straggler_delay_ms: u64,
    /// Probability (0-100) that a worker dies mid-task without reporting
    pub worker_crash_probability: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_map_tasks: 4,
            num_reduce_partitions: 1,
            num_workers: 4,
            task_timeout_ms: 10_000,
            max_attempts: 4,
            poll_interval_ms: 50,
            mapper_failure_probability: 0,
            reducer_failure_probability: 0,
            mapper_straggler_probability: 0,
            mapper_straggler_delay_ms: 1000,
            reducer_straggler_probability: 0,
            reducer_straggler_delay_ms: 1000,
            worker_crash_probability: 0,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_map_tasks == 0 {
            return Err(ConfigError::Invalid("num_map_tasks must be at least 1".into()));
        }
        if self.num_reduce_partitions == 0 {
            return Err(ConfigError::Invalid(
                "num_reduce_partitions must be at least 1".into(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        let probabilities = [
            ("mapper_failure_probability", self.mapper_failure_probability),
            ("reducer_failure_probability", self.reducer_failure_probability),
            ("mapper_straggler_probability", self.mapper_straggler_probability),
            ("reducer_straggler_probability", self.reducer_straggler_probability),
            ("worker_crash_probability", self.worker_crash_probability),
        ];
        for (name, value) in probabilities {
            if value > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 100, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        if self.task_timeout_ms > 0 {
            Some(Duration::from_millis(self.task_timeout_ms))
        } else {
            None
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Interval of the coordinator's timeout scan
    pub fn monitor_interval(&self) -> Duration {
        self.task_timeout()
            .map(|t| t / 10)
            .unwrap_or(Duration::from_millis(100))
            .max(Duration::from_millis(10))
    }

    pub fn print_summary(&self) {
        info!("Configuration:");
        info!("  - Map tasks: {}", self.num_map_tasks);
        info!("  - Reduce partitions: {}", self.num_reduce_partitions);
        info!("  - Workers: {}", self.num_workers);
        info!("  - Task timeout: {}ms", self.task_timeout_ms);
        info!("  - Max attempts: {}", self.max_attempts);
        if self.mapper_failure_probability > 0 || self.reducer_failure_probability > 0 {
            info!(
                "  - Failure probability: mapper {}%, reducer {}%",
                self.mapper_failure_probability, self.reducer_failure_probability
            );
        }
        if self.mapper_straggler_probability > 0 || self.reducer_straggler_probability > 0 {
            info!(
                "  - Straggler probability: mapper {}% (<= {}ms), reducer {}% (<= {}ms)",
                self.mapper_straggler_probability,
                self.mapper_straggler_delay_ms,
                self.reducer_straggler_probability,
                self.reducer_straggler_delay_ms
            );
        }
        if self.worker_crash_probability > 0 {
            info!("  - Crash probability: {}%", self.worker_crash_probability);
        }
    }
}
