// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use map_reduce_core::MapReduceJob;

/// Counts whitespace separated words, case and ASCII punctuation ignored
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

/// Lowercases `line`, drops ASCII punctuation and splits on whitespace
pub fn normalize_words(line: &str) -> Vec<String> {
    line.to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

impl MapReduceJob for WordCount {
    type Value = u64;
    type Output = u64;

    fn map(&self, record: &str) -> anyhow::Result<Vec<(String, u64)>> {
        Ok(normalize_words(record)
            .into_iter()
            .map(|word| (word, 1))
            .collect())
    }

    fn reduce(&self, _key: &str, values: Vec<u64>) -> anyhow::Result<u64> {
        Ok(values.into_iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punctuation_and_case_are_ignored() {
        assert_eq!(
            normalize_words("The cat, the CAT... sat!"),
            vec!["the", "cat", "the", "cat", "sat"]
        );
    }

    #[test]
    fn test_apostrophes_join_words() {
        assert_eq!(normalize_words("don't stop"), vec!["dont", "stop"]);
    }

    #[test]
    fn test_blank_line_emits_nothing() {
        assert!(WordCount.map("   \t ").unwrap().is_empty());
    }

    #[test]
    fn test_reduce_sums_counts() {
        assert_eq!(WordCount.reduce("the", vec![1, 1, 3]).unwrap(), 5);
    }
}
