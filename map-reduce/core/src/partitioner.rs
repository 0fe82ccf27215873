// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use fnv::FnvHasher;
use std::hash::Hasher;

/// Routes an intermediate key to one of `num_partitions` reduce partitions
/// Must return the same index for the same key on every call, in every process
pub trait Partitioner: Send + Sync + 'static {
    fn partition(&self, key: &str, num_partitions: usize) -> usize;
}

/// FNV-1a (zero seed) of the key bytes modulo the partition count
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl HashPartitioner {
    pub fn hash_key(key: &str) -> u64 {
        let mut hasher = FnvHasher::with_key(0);
        hasher.write(key.as_bytes());
        hasher.finish()
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, key: &str, num_partitions: usize) -> usize {
        if num_partitions <= 1 {
            return 0;
        }
        (Self::hash_key(key) % num_partitions as u64) as usize
    }
}
