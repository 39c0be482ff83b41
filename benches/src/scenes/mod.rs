use core::time::Duration;

use avian_async::prelude::*;
use bevy::{
    MinimalPlugins,
    app::{App, Plugin, PluginGroup, PluginGroupBuilder},
    time::TimeUpdateStrategy,
};

use crate::Benchmark;

mod chains;
mod cloth;

/// All benchmarks for `avian_async`.
pub const BENCHMARKS: &[Benchmark] = &[
    Benchmark::new("Large Cloth", "cloth", || cloth::create_bench(1, 96)),
    Benchmark::new("Many Cloths", "cloth", || cloth::create_bench(16, 24)),
    Benchmark::new("Falling Particles", "chains", || {
        chains::create_particles_bench(4096)
    }),
    Benchmark::new("Jointed Chains", "chains", || chains::create_chains_bench(64, 32)),
];

/// A plugin group that includes the minimal set of plugins used for benchmarking.
pub struct BenchmarkPlugins;

impl PluginGroup for BenchmarkPlugins {
    fn build(self) -> PluginGroupBuilder {
        PluginGroupBuilder::start::<BenchmarkPlugins>()
            .add_group(MinimalPlugins)
            .add(BenchmarkCorePlugin)
            .add(TetherSolverPlugin::new(benchmark_config()))
    }
}

/// All benchmarks use a fixed step of 60 FPS, solved on the task pools.
fn benchmark_config() -> SolverConfig {
    SolverConfig::default()
        .with_fixed_step(Some(1.0 / 60.0))
        .with_max_islands(16)
        .with_threading(ThreadingMode::TaskPool)
}

/// A plugin that sets up the frame time for benchmarking.
struct BenchmarkCorePlugin;

impl Plugin for BenchmarkCorePlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(TimeUpdateStrategy::ManualDuration(Duration::from_secs_f64(
            1.0 / 60.0,
        )));
    }
}
