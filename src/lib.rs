//! # Avian Async
//!
//! **Avian Async** is an asynchronous particle solver for the [Bevy game engine](https://bevyengine.org/),
//! based on *Extended Position Based Dynamics* (XPBD). It simulates particles, clusters of
//! particles held together by long-range tethers, and distance constraints between particles,
//! on a background task while the game keeps running.
//!
//! ## Architecture
//!
//! The crate is split into a producer side owned by the game and a solver side owned by the
//! background step:
//!
//! - The producer registers [proxies](proxy) that own particles or constraints, and writes to
//!   them through the [`PhysicsSolver`](solver::PhysicsSolver).
//! - Writes are recorded as deltas by the [marshalling](marshalling) layer and sealed into
//!   timestamped *push snapshots*, one per step.
//! - The [`Evolution`](dynamics::evolution::Evolution) consumes push snapshots in order, applies
//!   their deltas, and advances the simulation. Particles are partitioned into
//!   [islands](dynamics::solver::islands) that are solved in parallel.
//! - Every step produces a *pull snapshot* with the results of the proxies it moved. The
//!   producer reads them back, either directly or interpolated between the last two steps.
//!
//! The solver never reads producer data and the producer never reads solver data except
//! through snapshots, so stepping can safely run on another thread.
//!
//! ## Usage
//!
//! The solver can be used on its own:
//!
//! ```
//! use avian_async::prelude::*;
//!
//! let mut solver = PhysicsSolver::new(SolverConfig::default()).unwrap();
//! let ball = solver
//!     .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::Y * 5.0, 1.0))
//!     .unwrap();
//!
//! for _ in 0..60 {
//!     solver.advance_and_dispatch(1.0 / 60.0);
//!     solver.for_each_dirty_proxy_since_last_pull(|_| {});
//! }
//! solver.wait_for_pending();
//! ```
//!
//! or through the [`TetherSolverPlugin`](plugin::TetherSolverPlugin), which registers every
//! entity with a [`SolverParticle`](plugin::SolverParticle) and writes the results back to its
//! [`Transform`](bevy::prelude::Transform).
//!
//! ## Features
//!
//! - `f32` *(default)*: single precision math.
//! - `f64`: double precision math.
//! - `parallel` *(default)*: runs islands, tether batches and the advance task on Bevy's task
//!   pools. Without it, [`ThreadingMode::TaskPool`](config::ThreadingMode::TaskPool) steps inline.
//! - `serialize`: `serde` support for the configuration and the handle types.

#[cfg(all(feature = "f32", feature = "f64"))]
compile_error!("feature \"f32\" and feature \"f64\" cannot be enabled at the same time");

#[cfg(not(any(feature = "f32", feature = "f64")))]
compile_error!("either feature \"f32\" or \"f64\" must be enabled");

pub mod config;
pub mod data_structures;
pub mod dynamics;
pub mod marshalling;
pub mod math;
pub mod particles;
pub mod plugin;
pub mod proxy;
pub mod solver;

#[cfg(test)]
mod tests;

/// Re-exports common types.
pub mod prelude {
    pub use crate::{
        config::{ConfigError, SolverConfig, TetherConfig, TetherSolverKind, ThreadingMode},
        dynamics::{
            evolution::{StepInfo, SolverHooks},
            solver::{SolverDiagnostics, islands::Adjacency, tether::TetherMode},
        },
        marshalling::Timestamp,
        math::*,
        particles::{ParticleDesc, ParticleHandle},
        plugin::{SolverParticle, SolverProxy, TetherSolverPlugin, TetherSolverSet},
        proxy::{
            ExternalId, ParticleRef, Proxy, ProxyDesc, ProxyId, ProxyKind, ProxyState,
            RegistrationError,
        },
        solver::{CompletionToken, PhysicsSolver},
    };
}
