//! A command line interface for running solver benchmarks.
//!
//! Step times are taken from the diagnostics of every step the solver runs, not from the
//! wall clock around `App::update`. With `ThreadingMode::TaskPool`, an update only dispatches
//! its steps and overlaps them with the next frame, so the frame time says little about the solver.

use core::time::Duration;
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use avian_async::prelude::*;
use bevy::{
    app::{App, PluginsState},
    tasks::{AsyncComputeTaskPool, ComputeTaskPool, TaskPoolBuilder},
};
use clap::Parser;

use crate::Benchmark;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The name or number of the benchmark to run. Leave empty to run all benchmarks.
    #[arg(short, long)]
    pub name: Option<String>,

    /// The number of threads in the compute and async compute task pools.
    ///
    /// The pools are global, so each thread count needs its own process.
    #[arg(short, long, default_value_t = 4)]
    pub threads: usize,

    /// The number of frames to measure for each benchmark.
    #[arg(short, long, default_value_t = 500)]
    pub steps: u32,

    /// Frames run before measuring, so registration and the first topology build are excluded.
    #[arg(short, long, default_value_t = 10)]
    pub warmup: u32,

    /// List all available benchmarks in a numbered list.
    #[arg(short, long)]
    pub list: bool,

    /// A CSV file to append the per-stage results to.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }
}

/// Per-stage step times of one benchmark run.
#[derive(Clone, Debug, Default)]
pub struct StageTimes {
    /// The number of solver steps measured.
    pub steps: u32,
    /// The mean and minimum time of each stage, in stage order.
    pub stages: Vec<(&'static str, Duration, Duration)>,
    /// The mean and minimum total time of a step.
    pub total: (Duration, Duration),
    /// The island and tether counts of the last step.
    pub island_count: u32,
    pub tether_count: u32,
}

impl StageTimes {
    fn from_samples(samples: &[SolverDiagnostics]) -> Self {
        let Some(last) = samples.last() else {
            return Self::default();
        };
        let steps = samples.len() as u32;
        let summarize = |time: &dyn Fn(&SolverDiagnostics) -> Duration| {
            let sum: Duration = samples.iter().map(time).sum();
            let min = samples.iter().map(time).min().unwrap_or_default();
            (sum / steps, min)
        };

        let stages = last
            .timers()
            .iter()
            .enumerate()
            .map(|(i, &(name, _))| {
                let (mean, min) = summarize(&|diagnostics| diagnostics.timers()[i].1);
                (stage_name(name), mean, min)
            })
            .collect();

        Self {
            steps,
            stages,
            total: summarize(&SolverDiagnostics::total),
            island_count: last.island_count,
            tether_count: last.tether_count,
        }
    }
}

/// The last segment of a diagnostic path.
fn stage_name(path: &'static str) -> &'static str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn list(benchmarks: &[Benchmark]) {
    println!("Available benchmarks:");
    for (i, benchmark) in benchmarks.iter().enumerate() {
        println!("{:>2}. {}", i + 1, benchmark.name);
    }
}

/// Runs the benchmarks and prints a table of stage times for each.
pub fn run(benchmarks: &[&Benchmark], args: &Args) {
    init_task_pools(args.threads);

    let mut csv = String::new();
    for benchmark in benchmarks {
        println!(
            "'{}' ({}), {} threads:",
            benchmark.name, benchmark.module, args.threads
        );
        let times = run_benchmark(benchmark.constructor, args);
        print_table(&times);

        for (stage, mean, min) in &times.stages {
            let _ = writeln!(
                csv,
                "{},{},{stage},{:.6},{:.6}",
                benchmark.name,
                args.threads,
                mean.as_secs_f64() * 1000.0,
                min.as_secs_f64() * 1000.0
            );
        }
    }

    if let Some(path) = &args.output {
        if let Err(error) = append_csv(path, &csv) {
            eprintln!("Failed to write results to {}: {error}", path.display());
        } else {
            println!("Results written to {}", path.display());
        }
    }
}

fn print_table(times: &StageTimes) {
    println!(
        "{} steps, {} islands, {} tethers",
        times.steps, times.island_count, times.tether_count
    );
    println!("| stage             |  mean / step |   min / step |");
    println!("| ----------------- | ------------ | ------------ |");
    let rows = times
        .stages
        .iter()
        .copied()
        .chain([("total", times.total.0, times.total.1)]);
    for (stage, mean, min) in rows {
        println!(
            "| {stage:<17} | {:>9.4} ms | {:>9.4} ms |",
            mean.as_secs_f64() * 1000.0,
            min.as_secs_f64() * 1000.0
        );
    }
    println!();
}

fn append_csv(path: &Path, rows: &str) -> std::io::Result<()> {
    use std::io::Write;

    let is_new = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if is_new {
        writeln!(file, "benchmark,threads,stage,mean_ms,min_ms")?;
    }
    file.write_all(rows.as_bytes())
}

fn init_task_pools(threads: usize) {
    // Islands and tether batches run on the compute pool, advances on the async compute pool.
    ComputeTaskPool::get_or_init(|| TaskPoolBuilder::new().num_threads(threads).build());
    AsyncComputeTaskPool::get_or_init(|| TaskPoolBuilder::new().num_threads(threads).build());
}

fn run_benchmark(builder: fn() -> App, args: &Args) -> StageTimes {
    let mut app = builder();
    while app.plugins_state() != PluginsState::Ready {
        bevy::tasks::tick_global_task_pools_on_main_thread();
    }
    app.finish();
    app.cleanup();

    let samples = Arc::new(Mutex::new(Vec::new()));
    let recorder = samples.clone();
    app.world_mut()
        .non_send_resource_mut::<PhysicsSolver>()
        .set_post_step_hook(move |_, pull| {
            if let Ok(mut samples) = recorder.lock() {
                samples.push(pull.diagnostics);
            }
        });

    for _ in 0..args.warmup {
        app.update();
    }
    app.world_mut()
        .non_send_resource_mut::<PhysicsSolver>()
        .wait_for_pending();
    if let Ok(mut samples) = samples.lock() {
        samples.clear();
    }

    for _ in 0..args.steps {
        app.update();
    }
    app.world_mut()
        .non_send_resource_mut::<PhysicsSolver>()
        .wait_for_pending();

    samples
        .lock()
        .map(|samples| StageTimes::from_samples(&samples))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_times_average_every_step() {
        let step = |ms: u64, islands: u32| SolverDiagnostics {
            solve_constraints: Duration::from_millis(ms),
            push_out: Duration::from_millis(1),
            island_count: islands,
            ..Default::default()
        };
        let times = StageTimes::from_samples(&[step(4, 2), step(2, 3)]);

        assert_eq!(times.steps, 2);
        assert_eq!(times.island_count, 3);
        let solve = times
            .stages
            .iter()
            .find(|(stage, ..)| *stage == "solve_constraints")
            .unwrap();
        assert_eq!((solve.1, solve.2), (Duration::from_millis(3), Duration::from_millis(2)));
        assert_eq!(times.total, (Duration::from_millis(4), Duration::from_millis(3)));
        assert_eq!(times.stages.len(), 6);
    }
}
