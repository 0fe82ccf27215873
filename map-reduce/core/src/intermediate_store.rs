// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::{JobError, JobResult};
use crate::task::TaskId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::OnceCell;
use tracing::debug;

/// Identifies the sealed buffer one map attempt produced for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLocation {
    pub map_task: TaskId,
    pub attempt: u32,
    pub partition: usize,
    pub records: usize,
}

/// Holding area for map output until reduce tasks consume it
///
/// Async so that disk and network backed stores fit behind the same trait.
#[async_trait]
pub trait IntermediateStore<V: Send + 'static>: Clone + Send + Sync + 'static {
    /// Stores the buffer of `map_task` for `partition`, replacing the buffer
    /// of any earlier attempt. A late write from an older attempt never
    /// becomes visible to readers.
    async fn write_partition(
        &self,
        map_task: TaskId,
        attempt: u32,
        partition: usize,
        records: Vec<(String, V)>,
    ) -> JobResult<BufferLocation>;

    /// Returns the records of exactly the buffers named by `inputs`, in the
    /// order given
    async fn read_partition(
        &self,
        partition: usize,
        inputs: &[BufferLocation],
    ) -> JobResult<Vec<(String, V)>>;

    /// Drops every buffer this store wrote, leaving anything else in place
    async fn clear(&self) -> JobResult<()>;
}

/// Shuffle-and-sort: groups records by key with keys in sorted order
pub fn group_by_key<V>(records: Vec<(String, V)>) -> BTreeMap<String, Vec<V>> {
    let mut groups: BTreeMap<String, Vec<V>> = BTreeMap::new();
    for (key, value) in records {
        groups.entry(key).or_default().push(value);
    }
    groups
}

struct StoredBuffer<V> {
    attempt: u32,
    records: Arc<Vec<(String, V)>>,
}

/// In-memory store using Arc<Mutex<HashMap>>
pub struct InMemoryIntermediateStore<V> {
    buffers: Arc<Mutex<HashMap<(usize, TaskId), StoredBuffer<V>>>>,
}

impl<V> Clone for InMemoryIntermediateStore<V> {
    fn clone(&self) -> Self {
        Self {
            buffers: self.buffers.clone(),
        }
    }
}

impl<V> Default for InMemoryIntermediateStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> InMemoryIntermediateStore<V> {
    pub fn new() -> Self {
        Self {
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of buffers currently held
    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<V> IntermediateStore<V> for InMemoryIntermediateStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn write_partition(
        &self,
        map_task: TaskId,
        attempt: u32,
        partition: usize,
        records: Vec<(String, V)>,
    ) -> JobResult<BufferLocation> {
        let location = BufferLocation {
            map_task,
            attempt,
            partition,
            records: records.len(),
        };
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (partition, map_task);
        if buffers.get(&slot).is_some_and(|b| b.attempt > attempt) {
            return Ok(location);
        }
        buffers.insert(
            slot,
            StoredBuffer {
                attempt,
                records: Arc::new(records),
            },
        );
        Ok(location)
    }

    async fn read_partition(
        &self,
        partition: usize,
        inputs: &[BufferLocation],
    ) -> JobResult<Vec<(String, V)>> {
        let selected = {
            let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let mut selected = Vec::with_capacity(inputs.len());
            for input in inputs {
                match buffers.get(&(partition, input.map_task)) {
                    Some(buffer) if buffer.attempt == input.attempt => {
                        selected.push(buffer.records.clone())
                    }
                    _ => {
                        return Err(JobError::Storage(format!(
                            "missing buffer for map task {} attempt {} partition {}",
                            input.map_task, input.attempt, partition
                        )))
                    }
                }
            }
            selected
        };

        Ok(selected
            .iter()
            .flat_map(|records| records.iter().cloned())
            .collect())
    }

    async fn clear(&self) -> JobResult<()> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// Spills every buffer to a JSON-lines file under `dir`
///
/// Each attempt writes its own file, so readers only ever see the attempt
/// named in their `BufferLocation`. Nothing touches the disk before the first
/// write. `clear` removes only the `mr-*` buffers this store names, plus `dir`
/// itself when the store created it and it is left empty.
pub struct FileIntermediateStore<V> {
    dir: Arc<PathBuf>,
    created_dir: Arc<OnceCell<bool>>,
    _phantom: PhantomData<fn() -> V>,
}

impl<V> Clone for FileIntermediateStore<V> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            created_dir: self.created_dir.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<V> FileIntermediateStore<V> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
            created_dir: Arc::new(OnceCell::new()),
            _phantom: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn buffer_path(&self, map_task: TaskId, partition: usize, attempt: u32) -> PathBuf {
        self.dir
            .join(format!("mr-{}-{}.attempt-{}", map_task, partition, attempt))
    }

    /// Creates `dir` on first use and remembers whether it was missing
    async fn ensure_dir(&self) -> JobResult<()> {
        let dir = self.dir.as_path();
        self.created_dir
            .get_or_try_init(|| async move {
                let existed = fs::try_exists(dir)
                    .await
                    .map_err(|e| JobError::io(dir, e))?;
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| JobError::io(dir, e))?;
                Ok::<_, JobError>(!existed)
            })
            .await?;
        Ok(())
    }
}

/// True for `mr-<task>-<partition>.attempt-<n>` and its `.tmp` sibling
fn is_buffer_file(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("mr-") else {
        return false;
    };
    let Some((ids, attempt)) = rest.split_once(".attempt-") else {
        return false;
    };
    let attempt = attempt.strip_suffix(".tmp").unwrap_or(attempt);
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match ids.split_once('-') {
        Some((task, partition)) => numeric(task) && numeric(partition) && numeric(attempt),
        None => false,
    }
}

#[async_trait]
impl<V> IntermediateStore<V> for FileIntermediateStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn write_partition(
        &self,
        map_task: TaskId,
        attempt: u32,
        partition: usize,
        records: Vec<(String, V)>,
    ) -> JobResult<BufferLocation> {
        let location = BufferLocation {
            map_task,
            attempt,
            partition,
            records: records.len(),
        };

        self.ensure_dir().await?;
        let path = self.buffer_path(map_task, partition, attempt);
        let tmp_path = path.with_extension(format!("attempt-{}.tmp", attempt));
        let file = File::create(&tmp_path)
            .await
            .map_err(|e| JobError::io(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        for record in &records {
            let mut line = serde_json::to_vec(record)
                .map_err(|e| JobError::Storage(format!("failed to encode record: {}", e)))?;
            line.push(b'\n');
            writer
                .write_all(&line)
                .await
                .map_err(|e| JobError::io(&tmp_path, e))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| JobError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| JobError::io(&path, e))?;

        for older in 1..attempt {
            let stale = self.buffer_path(map_task, partition, older);
            if let Err(e) = fs::remove_file(&stale).await {
                if e.kind() != ErrorKind::NotFound {
                    return Err(JobError::io(&stale, e));
                }
            }
        }

        Ok(location)
    }

    async fn read_partition(
        &self,
        partition: usize,
        inputs: &[BufferLocation],
    ) -> JobResult<Vec<(String, V)>> {
        let mut records = Vec::new();
        for input in inputs {
            let path = self.buffer_path(input.map_task, partition, input.attempt);
            let file = File::open(&path).await.map_err(|e| {
                JobError::Storage(format!("missing buffer {}: {}", path.display(), e))
            })?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| JobError::io(&path, e))?
            {
                let record: (String, V) = serde_json::from_str(&line).map_err(|e| {
                    JobError::Storage(format!("corrupt record in {}: {}", path.display(), e))
                })?;
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn clear(&self) -> JobResult<()> {
        let dir = self.dir.as_path();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(JobError::io(dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| JobError::io(dir, e))? {
            let owned = entry.file_name().to_str().is_some_and(is_buffer_file);
            if !owned {
                continue;
            }
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != ErrorKind::NotFound {
                    return Err(JobError::io(&path, e));
                }
            }
        }

        // A directory that held anything else before the job is left alone
        if self.created_dir.get() == Some(&true) {
            match fs::remove_dir(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!("Keeping spill dir {}: {}", dir.display(), e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::is_buffer_file;

    #[test]
    fn test_buffer_file_names() {
        assert!(is_buffer_file("mr-0-3.attempt-1"));
        assert!(is_buffer_file("mr-12-0.attempt-2.tmp"));
        assert!(!is_buffer_file("mr-0-3"));
        assert!(!is_buffer_file("mr-a-3.attempt-1"));
        assert!(!is_buffer_file("mr-0-3.attempt-"));
        assert!(!is_buffer_file("notes.txt"));
    }
}
