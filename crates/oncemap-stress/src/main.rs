//! Stress-tests a [`Cache`] under configurable concurrent workloads.
//!
//! Workloads are defined in a YAML file (see `workloads.example.yml`); each
//! one hammers its own cache from a fixed number of threads for the requested
//! duration and reports throughput and build/eviction counts.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use oncemap::Cache;
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct WorkloadsConfig {
    workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
struct Workload {
    /// Number of threads hammering the cache.
    concurrency: usize,
    /// Size of the key space the threads draw from.
    keys: u32,
    /// Simulated build time per factory invocation.
    #[serde(default, with = "humantime_serde")]
    build_delay: Duration,
    /// Probability that a build fails.
    #[serde(default)]
    failure_rate: f64,
    /// Remove a random key every n operations (0 disables eviction).
    #[serde(default)]
    evict_every: usize,
}

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to the workload definition file.
    #[arg(long = "workloads", short = 'w', value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long = "duration", short = 'd', value_parser = parse_duration)]
    duration: Duration,
}

#[derive(Default)]
struct WorkloadStats {
    ops: AtomicUsize,
    built: AtomicUsize,
    failed: AtomicUsize,
    evicted: AtomicUsize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    tracing_subscriber::fmt::init();

    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let start = Instant::now();
        let stats = run_workload(&workload, cli.duration);

        let ops = stats.ops.load(Ordering::Relaxed);
        let ops_ps = ops as f32 / start.elapsed().as_secs_f32();
        println!(
            "Workload {i} (concurrency: {}, keys: {}): {ops} operations, {ops_ps:.0} ops/s, \
             {} built, {} failed, {} evicted",
            workload.concurrency,
            workload.keys,
            stats.built.load(Ordering::Relaxed),
            stats.failed.load(Ordering::Relaxed),
            stats.evicted.load(Ordering::Relaxed),
        );
    }

    Ok(())
}

fn run_workload(workload: &Workload, duration: Duration) -> Arc<WorkloadStats> {
    let stats = Arc::new(WorkloadStats::default());

    let build_delay = workload.build_delay;
    let failure_rate = workload.failure_rate;
    let evicted = Arc::clone(&stats);
    let cache: Cache<u32, Vec<u8>> = Cache::builder(move |key: &u32| {
        if !build_delay.is_zero() {
            thread::sleep(build_delay);
        }
        if failure_rate > 0.0 && rand::rng().random_bool(failure_rate) {
            anyhow::bail!("injected build failure");
        }
        Ok(key.to_le_bytes().repeat(64))
    })
    .disposer(move |_, _| {
        evicted.evicted.fetch_add(1, Ordering::Relaxed);
    })
    .build();

    let built = Arc::clone(&stats);
    cache.on_created(move |_, _| {
        built.built.fetch_add(1, Ordering::Relaxed);
    });
    let failed = Arc::clone(&stats);
    cache.on_failed(move |_, _| {
        failed.failed.fetch_add(1, Ordering::Relaxed);
    });

    let deadline = Instant::now() + duration;
    thread::scope(|scope| {
        let cache = &cache;
        let stats = &stats;
        for _ in 0..workload.concurrency {
            scope.spawn(move || {
                let mut rng = rand::rng();
                let mut ops = 0usize;

                while Instant::now() < deadline {
                    let key = rng.random_range(0..workload.keys);
                    let _ = cache.get_or_create(key);
                    ops += 1;

                    if workload.evict_every != 0 && ops % workload.evict_every == 0 {
                        cache.remove(&rng.random_range(0..workload.keys));
                    }
                }

                stats.ops.fetch_add(ops, Ordering::Relaxed);
            });
        }
    });

    stats
}
