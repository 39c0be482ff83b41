//! The constraint solver: island partitioning, tethers, joints, and per-island solving.
//!
//! The solver runs inside each step of the [`Evolution`](crate::dynamics::evolution::Evolution):
//!
//! 1. The particles are partitioned into [islands](islands) whenever the topology changes.
//! 2. Each island gathers its particles into an [`IslandSolver`](island_solver::IslandSolver).
//! 3. [Tethers](tether), [joints](joints::DistanceJoint) and [suspensions](joints::Suspension)
//!    are projected on the island's private copy, islands in parallel.
//! 4. The results are scattered back to the [`ParticleStore`](crate::particles::ParticleStore).

pub mod island_solver;
pub mod islands;
pub mod joints;
pub mod tether;
pub mod xpbd;

mod diagnostics;
pub use diagnostics::SolverDiagnostics;

use bevy::tasks::{ComputeTaskPool, TaskPool};

/// Returns the compute task pool, initializing it if no app has done so yet.
#[inline]
pub(crate) fn compute_task_pool() -> &'static TaskPool {
    ComputeTaskPool::get_or_init(TaskPool::default)
}
