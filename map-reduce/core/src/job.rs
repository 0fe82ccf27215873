// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::marker::PhantomData;

/// Trait that defines a specific MapReduce job
/// Abstracts the business logic from the execution model
///
/// Both functions must be pure: the engine may call them any number of times
/// for the same input when attempts are retried.
pub trait MapReduceJob: Send + Sync + 'static {
    /// Intermediate value emitted by `map`
    type Value: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Aggregate produced by `reduce`, written as the segment value. Its
    /// `Display` form must fit on one line.
    type Output: Display + Send + 'static;

    /// Turns one input record into intermediate pairs. Keys may not contain
    /// tabs or line breaks; a map attempt emitting one fails.
    fn map(&self, record: &str) -> anyhow::Result<Vec<(String, Self::Value)>>;

    /// Folds every value a key received into its aggregate
    fn reduce(&self, key: &str, values: Vec<Self::Value>) -> anyhow::Result<Self::Output>;
}

/// Job built from a pair of closures
pub struct FnJob<M, R, V, O> {
    map_fn: M,
    reduce_fn: R,
    _phantom: PhantomData<fn() -> (V, O)>,
}

impl<M, R, V, O> FnJob<M, R, V, O>
where
    M: Fn(&str) -> anyhow::Result<Vec<(String, V)>> + Send + Sync + 'static,
    R: Fn(&str, Vec<V>) -> anyhow::Result<O> + Send + Sync + 'static,
{
    pub fn new(map_fn: M, reduce_fn: R) -> Self {
        Self {
            map_fn,
            reduce_fn,
            _phantom: PhantomData,
        }
    }
}

impl<M, R, V, O> MapReduceJob for FnJob<M, R, V, O>
where
    M: Fn(&str) -> anyhow::Result<Vec<(String, V)>> + Send + Sync + 'static,
    R: Fn(&str, Vec<V>) -> anyhow::Result<O> + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Display + Send + 'static,
{
    type Value = V;
    type Output = O;

    fn map(&self, record: &str) -> anyhow::Result<Vec<(String, V)>> {
        (self.map_fn)(record)
    }

    fn reduce(&self, key: &str, values: Vec<V>) -> anyhow::Result<O> {
        (self.reduce_fn)(key, values)
    }
}

/// Overall state of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}
