//! Solving a single island on a private copy of its particles.
//!
//! An [`IslandSolver`] gathers the predicted positions and inverse masses of its particles
//! into local buffers, projects every constraint of the island on them, and keeps the result
//! until the [`Evolution`](crate::dynamics::evolution::Evolution) scatters it back.
//! Constraints are stored with island-local particle indices.
//!
//! Islands never share particles, so any number of island solvers can run at the same time
//! while reading from the same [`ParticleStore`].

use super::{
    joints::{DistanceJoint, Suspension},
    tether::TetherConstraintSet,
};
use crate::{config::SolverConfig, math::*, particles::ParticleStore, proxy::ProxyId};

/// The constraints and scratch buffers of one island.
#[derive(Clone, Debug, Default)]
pub struct IslandSolver {
    /// The particle slots of the island, in ascending order.
    pub(crate) particles: Vec<usize>,
    /// Tether sets of the clusters in this island.
    pub(crate) tethers: Vec<(ProxyId, TetherConstraintSet)>,
    pub(crate) joints: Vec<(ProxyId, DistanceJoint)>,
    pub(crate) suspensions: Vec<(ProxyId, Suspension)>,
    positions: Vec<Vector>,
    inverse_masses: Vec<Scalar>,
    solved_positions: Vec<Vector>,
}

impl IslandSolver {
    /// Creates an island solver without constraints.
    pub fn new(particles: Vec<usize>) -> Self {
        Self {
            particles,
            ..Default::default()
        }
    }

    /// Returns the particle slots of the island.
    pub fn particles(&self) -> &[usize] {
        &self.particles
    }

    /// Returns the number of tethers in the island.
    pub fn tether_count(&self) -> usize {
        self.tethers
            .iter()
            .map(|(_, set)| set.constraints().len())
            .sum()
    }

    /// Copies the predicted positions and inverse masses of the island's particles.
    pub fn gather(&mut self, store: &ParticleStore) {
        self.positions.clear();
        self.inverse_masses.clear();
        for &slot in &self.particles {
            self.positions.push(store.predicted_positions[slot]);
            self.inverse_masses.push(store.inverse_masses[slot]);
        }
    }

    /// Runs the projection passes.
    ///
    /// Multipliers are reset first, so nothing carries over from the previous step.
    pub fn solve(&mut self, config: &SolverConfig, dt: Scalar, parallel_tethers: bool) {
        for (_, set) in &mut self.tethers {
            set.init();
        }
        for (_, joint) in &mut self.joints {
            joint.clear_lagrange();
        }
        for (_, suspension) in &mut self.suspensions {
            suspension.clear_lagrange();
        }

        for _ in 0..config.position_iterations {
            for (_, set) in &mut self.tethers {
                set.apply(&mut self.positions, &self.inverse_masses, dt, parallel_tethers);
            }
            for _ in 0..config.joint_iterations {
                for (_, joint) in &mut self.joints {
                    joint.solve(&mut self.positions, &self.inverse_masses, dt);
                }
                for (_, suspension) in &mut self.suspensions {
                    suspension.solve(&mut self.positions, &self.inverse_masses, dt);
                }
            }
        }

        self.solved_positions.clear();
        self.solved_positions.extend_from_slice(&self.positions);
    }

    /// Runs rigid tether passes on top of the solved positions.
    ///
    /// The corrections only affect the final positions, not the velocities.
    pub fn push_out(&mut self, iterations: u32, parallel_tethers: bool) {
        for _ in 0..iterations {
            for (_, set) in &self.tethers {
                set.apply_rigid(&mut self.positions, &self.inverse_masses, parallel_tethers);
            }
        }
    }

    /// Positions after the projection passes, used for velocities.
    pub fn solved_positions(&self) -> &[Vector] {
        &self.solved_positions
    }

    /// Final positions after push-out.
    pub fn positions(&self) -> &[Vector] {
        &self.positions
    }

    /// Iterates over the forces applied by joints and suspensions during the last step.
    pub fn constraint_forces(&self, dt: Scalar) -> impl Iterator<Item = (ProxyId, Vector)> + '_ {
        self.joints
            .iter()
            .map(move |(proxy, joint)| (*proxy, joint.force(dt)))
            .chain(
                self.suspensions
                    .iter()
                    .map(move |(proxy, suspension)| (*proxy, suspension.force(dt))),
            )
    }
}
