// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use map_reduce_core::{
    split_files, Config, FileIntermediateStore, InMemoryIntermediateStore, JobError,
    MapReduceEngine, SUCCESS_MARKER,
};
use map_reduce_word_count::WordCount;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn write_inputs(dir: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    for (name, contents) in files {
        fs::write(dir.join(name), contents).unwrap();
    }
}

fn engine(maps: usize, reduces: usize) -> MapReduceEngine {
    MapReduceEngine::new(Config {
        num_map_tasks: maps,
        num_reduce_partitions: reduces,
        num_workers: 2,
        poll_interval_ms: 5,
        ..Config::default()
    })
    .unwrap()
}

fn counts(results: Vec<(String, String)>) -> BTreeMap<String, u64> {
    results
        .into_iter()
        .map(|(k, v)| (k, v.parse().unwrap()))
        .collect()
}

#[tokio::test]
async fn test_liveness_counts_words_across_files() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input");
    let out = tmp.path().join("output");
    write_inputs(&input, &[("a.txt", "the cat sat\n"), ("b.txt", "the dog sat\n")]);

    let engine = engine(2, 1);
    let splits = split_files(&input, engine.config().num_map_tasks).unwrap();
    let output = engine
        .run(WordCount, splits, InMemoryIntermediateStore::new(), &out)
        .await
        .unwrap();

    let expected: BTreeMap<String, u64> = [("cat", 1), ("dog", 1), ("sat", 2), ("the", 2)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    assert_eq!(counts(output.read_results().await.unwrap()), expected);

    assert_eq!(
        fs::read_to_string(out.join("part-00000")).unwrap(),
        "cat\t1\ndog\t1\nsat\t2\nthe\t2\n"
    );
    assert!(out.join(SUCCESS_MARKER).exists());
}

#[tokio::test]
async fn test_safety_rerun_into_same_output_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input");
    let out = tmp.path().join("output");
    write_inputs(&input, &[("a.txt", "the cat sat\n")]);

    let engine = engine(1, 1);
    engine
        .run(
            WordCount,
            split_files(&input, 1).unwrap(),
            InMemoryIntermediateStore::new(),
            &out,
        )
        .await
        .unwrap();
    let committed = fs::read_to_string(out.join("part-00000")).unwrap();

    let err = engine
        .run(
            WordCount,
            split_files(&input, 1).unwrap(),
            InMemoryIntermediateStore::new(),
            &out,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::OutputConflict { .. }));
    assert_eq!(fs::read_to_string(out.join("part-00000")).unwrap(), committed);
}

#[tokio::test]
async fn test_liveness_case_and_punctuation_fold_together() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input");
    write_inputs(
        &input,
        &[
            ("1.txt", "Hello, world!\nHELLO again.\n"),
            ("2.txt", "world... hello?\n"),
            ("3.txt", "\n\n"),
        ],
    );

    let engine = engine(3, 3);
    let spill = tmp.path().join("spill");
    let output = engine
        .run(
            WordCount,
            split_files(&input, 3).unwrap(),
            FileIntermediateStore::new(&spill),
            tmp.path().join("output"),
        )
        .await
        .unwrap();

    assert_eq!(output.segments.len(), 3);
    let results = counts(output.read_results().await.unwrap());
    assert_eq!(results.get("hello"), Some(&3));
    assert_eq!(results.get("world"), Some(&2));
    assert_eq!(results.get("again"), Some(&1));
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn test_liveness_partition_count_does_not_change_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input");
    let text = "it was the best of times it was the worst of times\n";
    write_inputs(&input, &[("a.txt", text), ("b.txt", text), ("c.txt", text)]);

    let mut outcomes = Vec::new();
    for (maps, reduces) in [(1, 1), (3, 4)] {
        let engine = engine(maps, reduces);
        let output = engine
            .run(
                WordCount,
                split_files(&input, maps).unwrap(),
                InMemoryIntermediateStore::new(),
                tmp.path().join(format!("out-{}", reduces)),
            )
            .await
            .unwrap();
        outcomes.push(counts(output.read_results().await.unwrap()));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0]["times"], 6);
}
