// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

pub const SUCCESS_MARKER: &str = "_SUCCESS";
const STAGING_DIR: &str = "_temporary";

/// Final file name of the segment for `partition`
pub fn segment_file_name(partition: usize) -> String {
    format!("part-{:05}", partition)
}

/// One reduce attempt's staged output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLocation {
    pub partition: usize,
    pub attempt: u32,
    pub path: PathBuf,
    pub records: usize,
}

/// Owns the output directory of a job
///
/// Reduce attempts stage their segments under `_temporary`, one file per
/// attempt, so a straggler can never overwrite the segment that gets
/// committed.
#[derive(Debug, Clone)]
pub struct OutputCommitter {
    dir: PathBuf,
    staging: PathBuf,
}

impl OutputCommitter {
    /// Claims `dir` for a new job. Refuses a destination that already holds
    /// data, without writing anything.
    pub async fn prepare(dir: impl Into<PathBuf>) -> JobResult<Self> {
        let dir = dir.into();
        match fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => return Err(JobError::OutputConflict { path: dir }),
            Ok(_) => {
                let mut entries = fs::read_dir(&dir)
                    .await
                    .map_err(|e| JobError::io(&dir, e))?;
                if entries
                    .next_entry()
                    .await
                    .map_err(|e| JobError::io(&dir, e))?
                    .is_some()
                {
                    return Err(JobError::OutputConflict { path: dir });
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(JobError::io(&dir, e)),
        }

        let staging = dir.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| JobError::io(&staging, e))?;
        Ok(Self { dir, staging })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `records` as `key<TAB>value` lines. Records must already be
    /// sorted by key.
    pub async fn write_segment(
        &self,
        partition: usize,
        attempt: u32,
        records: &[(String, String)],
    ) -> JobResult<SegmentLocation> {
        let path = self.staging.join(format!(
            "{}.attempt-{}",
            segment_file_name(partition),
            attempt
        ));
        let file = File::create(&path)
            .await
            .map_err(|e| JobError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        for (key, value) in records {
            writer
                .write_all(format!("{}\t{}\n", key, value).as_bytes())
                .await
                .map_err(|e| JobError::io(&path, e))?;
        }
        writer.flush().await.map_err(|e| JobError::io(&path, e))?;

        debug!(partition, attempt, records = records.len(), "staged segment");
        Ok(SegmentLocation {
            partition,
            attempt,
            path,
            records: records.len(),
        })
    }

    /// Removes the staging directory without committing anything
    pub async fn abort(&self) -> JobResult<()> {
        match fs::remove_dir_all(&self.staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::io(&self.staging, e)),
        }
    }
}

/// Merges committed segments into the final output and writes the marker
pub struct OutputAssembler;

impl OutputAssembler {
    /// `segments` must hold exactly one committed segment per partition in
    /// `0..num_partitions`; otherwise nothing is touched.
    pub async fn assemble(
        committer: &OutputCommitter,
        segments: &[SegmentLocation],
        num_partitions: usize,
    ) -> JobResult<JobOutput> {
        let mut ordered: Vec<Option<&SegmentLocation>> = vec![None; num_partitions];
        for segment in segments {
            let duplicate = match ordered.get_mut(segment.partition) {
                Some(slot) => slot.replace(segment).is_some(),
                None => true,
            };
            if duplicate {
                return Err(JobError::InvalidJob(format!(
                    "unexpected segment for partition {}",
                    segment.partition
                )));
            }
        }
        let ordered = ordered
            .into_iter()
            .enumerate()
            .map(|(partition, segment)| {
                segment.ok_or_else(|| {
                    JobError::InvalidJob(format!(
                        "partition {} has no committed segment",
                        partition
                    ))
                })
            })
            .collect::<JobResult<Vec<_>>>()?;

        let mut paths = Vec::with_capacity(ordered.len());
        for segment in ordered {
            let target = committer.dir.join(segment_file_name(segment.partition));
            fs::rename(&segment.path, &target)
                .await
                .map_err(|e| JobError::io(&segment.path, e))?;
            paths.push(target);
        }
        committer.abort().await?;

        let marker = committer.dir.join(SUCCESS_MARKER);
        File::create(&marker)
            .await
            .map_err(|e| JobError::io(&marker, e))?;

        info!(
            "Output assembled: {} segments in {}",
            paths.len(),
            committer.dir.display()
        );
        Ok(JobOutput {
            dir: committer.dir.clone(),
            segments: paths,
            success_marker: marker,
        })
    }
}

/// Final result of a succeeded job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub dir: PathBuf,
    /// `part-NNNNN` files in partition order
    pub segments: Vec<PathBuf>,
    pub success_marker: PathBuf,
}

impl JobOutput {
    /// Loads every `key<TAB>value` pair, segment by segment
    pub async fn read_results(&self) -> JobResult<Vec<(String, String)>> {
        let mut results = Vec::new();
        for path in &self.segments {
            let file = File::open(path).await.map_err(|e| JobError::io(path, e))?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await.map_err(|e| JobError::io(path, e))? {
                match line.split_once('\t') {
                    Some((key, value)) => results.push((key.to_string(), value.to_string())),
                    None => {
                        return Err(JobError::Storage(format!(
                            "malformed line in {}: {}",
                            path.display(),
                            line
                        )))
                    }
                }
            }
        }
        Ok(results)
    }
}
