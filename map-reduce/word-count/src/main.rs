// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use anyhow::Context;
use clap::Parser;
use map_reduce_core::telemetry::init_tracing;
use map_reduce_core::{
    split_files, Config, FileIntermediateStore, FileSplit, InMemoryIntermediateStore,
    IntermediateStore, JobOutput, MapReduceEngine,
};
use map_reduce_word_count::WordCount;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

/// Counts words across every file of a directory
#[derive(Debug, Parser)]
#[command(name = "map-reduce-word-count", version)]
struct Args {
    /// Directory whose files are counted
    input_dir: PathBuf,

    /// Destination for part-NNNNN files; must be absent or empty
    output_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of map tasks
    #[arg(long)]
    maps: Option<usize>,

    /// Override the number of reduce partitions
    #[arg(long)]
    reduces: Option<usize>,

    /// Override the number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Spill intermediate data to this directory instead of memory
    #[arg(long)]
    spill_dir: Option<PathBuf>,

    /// More detail in log lines (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(&path.to_string_lossy())
                .with_context(|| format!("cannot load config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(maps) = self.maps {
            config.num_map_tasks = maps;
        }
        if let Some(reduces) = self.reduces {
            config.num_reduce_partitions = reduces;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

async fn run_job<S>(
    engine: &MapReduceEngine,
    splits: Vec<FileSplit>,
    store: S,
    output_dir: PathBuf,
) -> anyhow::Result<JobOutput>
where
    S: IntermediateStore<u64>,
{
    let handle = engine.submit(WordCount, splits, store, output_dir).await?;

    let coordinator = handle.coordinator().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job");
            coordinator.cancel();
        }
    });

    let result = handle.wait().await;
    interrupt.abort();
    Ok(result?)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let config = args.load_config()?;

    info!("=== MAP-REDUCE WORD COUNT ===");
    config.print_summary();

    let splits = split_files(&args.input_dir, config.num_map_tasks)?;
    info!(
        "Read input directory {} into {} splits",
        args.input_dir.display(),
        splits.len()
    );

    let engine = MapReduceEngine::new(config)?;
    let output = match &args.spill_dir {
        Some(dir) => {
            let store = FileIntermediateStore::new(dir.clone());
            run_job(&engine, splits, store, args.output_dir.clone()).await?
        }
        None => {
            run_job(
                &engine,
                splits,
                InMemoryIntermediateStore::new(),
                args.output_dir.clone(),
            )
            .await?
        }
    };

    info!(
        "Wrote {} segments to {}",
        output.segments.len(),
        output.dir.display()
    );
    info!("Total time: {:.2?}", start_time.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing("info", args.verbose);

    if let Err(e) = run(args).await {
        error!("Job failed: {:#}", e);
        std::process::exit(1);
    }
}
