// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::{JobError, JobResult};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Finite, lazy sequence of raw records
pub type Records<'a> = Box<dyn Iterator<Item = io::Result<String>> + Send + 'a>;

/// A contiguous logical slice of input records assigned to one map task
///
/// `open` may be called once per attempt; every call starts over from the
/// first record of the split, so a retried map task sees the same input.
pub trait InputSplit: Send + Sync + 'static {
    /// Human readable name used in errors and logs
    fn describe(&self) -> String;

    fn open(&self) -> JobResult<Records<'_>>;
}

/// A range of lines held in memory
#[derive(Debug, Clone)]
pub struct LineSplit {
    lines: Arc<[String]>,
    range: Range<usize>,
}

impl LineSplit {
    pub fn new(lines: Vec<String>) -> Self {
        let range = 0..lines.len();
        Self {
            lines: lines.into(),
            range,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl InputSplit for LineSplit {
    fn describe(&self) -> String {
        format!("lines[{}..{}]", self.range.start, self.range.end)
    }

    fn open(&self) -> JobResult<Records<'_>> {
        Ok(Box::new(
            self.lines[self.range.clone()].iter().cloned().map(Ok),
        ))
    }
}

/// Splits `lines` into at most `num_splits` contiguous chunks
pub fn split_lines(lines: Vec<String>, num_splits: usize) -> Vec<LineSplit> {
    let num_splits = num_splits.max(1);
    let lines: Arc<[String]> = lines.into();
    if lines.is_empty() {
        return vec![LineSplit {
            lines,
            range: 0..0,
        }];
    }

    let chunk_size = lines.len().div_ceil(num_splits);
    (0..lines.len())
        .step_by(chunk_size)
        .map(|start| LineSplit {
            lines: lines.clone(),
            range: start..std::cmp::min(start + chunk_size, lines.len()),
        })
        .collect()
}

/// An ordered group of files read line by line
#[derive(Debug, Clone)]
pub struct FileSplit {
    paths: Vec<PathBuf>,
}

impl FileSplit {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl InputSplit for FileSplit {
    fn describe(&self) -> String {
        self.paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn open(&self) -> JobResult<Records<'_>> {
        // Open every file up front so a missing file fails the attempt before any map output
        let mut readers = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let file = File::open(path).map_err(|e| JobError::InputUnreadable {
                source_name: path.display().to_string(),
                message: e.to_string(),
            })?;
            readers.push(BufReader::new(file));
        }
        Ok(Box::new(readers.into_iter().flat_map(BufRead::lines)))
    }
}

/// Lists the regular files of `dir` in name order and groups them into at
/// most `num_splits` contiguous splits
pub fn split_files(dir: &Path, num_splits: usize) -> JobResult<Vec<FileSplit>> {
    let unreadable = |e: io::Error| JobError::InputUnreadable {
        source_name: dir.display().to_string(),
        message: e.to_string(),
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(JobError::InvalidJob(format!(
            "input directory {} contains no files",
            dir.display()
        )));
    }

    let chunk_size = files.len().div_ceil(num_splits.max(1));
    Ok(files
        .chunks(chunk_size)
        .map(|chunk| FileSplit::new(chunk.to_vec()))
        .collect())
}
