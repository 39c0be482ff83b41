use bevy::tasks::ParallelSliceMut;

use super::{Tether, TetherConstraints, should_parallelize};
use crate::{dynamics::solver::compute_task_pool, math::*};

/// The compliance of a tether with a stiffness of one.
///
/// Stiffness in `[0, 1]` is mapped to the compliance `MAX_COMPLIANCE / stiffness`.
pub const MAX_COMPLIANCE: Scalar = 1e-3;

/// Tethers projected with Extended Position-Based Dynamics.
///
/// Each tether accumulates a Lagrange multiplier over the passes of one step.
/// [`init`](Self::init) must be called at the start of every step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XpbdTethers {
    pub(crate) constraints: TetherConstraints,
    lambdas: Vec<Scalar>,
}

impl XpbdTethers {
    /// Creates a new [`XpbdTethers`] with zeroed multipliers.
    pub fn new(constraints: TetherConstraints) -> Self {
        let lambdas = vec![0.0; constraints.len()];
        Self {
            constraints,
            lambdas,
        }
    }

    /// Returns the underlying tethers.
    pub fn constraints(&self) -> &TetherConstraints {
        &self.constraints
    }

    /// Returns the accumulated Lagrange multipliers, in the order of
    /// [`TetherConstraints::tethers`].
    pub fn lambdas(&self) -> &[Scalar] {
        &self.lambdas
    }

    /// Resets every Lagrange multiplier to zero.
    pub fn init(&mut self) {
        self.lambdas.clear();
        self.lambdas.resize(self.constraints.len(), 0.0);
    }

    /// Returns the compliance term for a step of `dt`,
    /// or `None` if the tethers should not be solved at all.
    #[inline]
    pub fn alpha(&self, dt: Scalar) -> Option<Scalar> {
        let stiffness = self.constraints.stiffness();
        (stiffness > 0.0 && dt > 0.0).then(|| MAX_COMPLIANCE / (stiffness * dt * dt))
    }

    /// Runs one projection pass over every batch.
    pub fn apply(
        &mut self,
        positions: &mut [Vector],
        inverse_masses: &[Scalar],
        dt: Scalar,
        parallel: bool,
    ) {
        let Some(alpha) = self.alpha(dt) else {
            return;
        };
        let Self {
            constraints,
            lambdas,
        } = self;

        for batch in constraints.batches() {
            let tethers = &constraints.tethers()[batch.clone()];
            let mut lambdas = &mut lambdas[batch.clone()];

            if should_parallelize(tethers.len(), parallel) {
                let pool = compute_task_pool();
                let chunk_size = tethers.len().div_ceil(pool.thread_num().max(1));
                let shared: &[Vector] = positions;
                let corrections = lambdas.par_chunk_map_mut(pool, chunk_size, |i, chunk| {
                    let first = i * chunk_size;
                    chunk
                        .iter_mut()
                        .enumerate()
                        .map(|(k, lambda)| {
                            let tether = &tethers[first + k];
                            let (direction, offset) = tether.delta(shared, inverse_masses);
                            let delta_lambda = (offset - alpha * *lambda) / (1.0 + alpha);
                            *lambda += delta_lambda;
                            (tether.end, delta_lambda * direction)
                        })
                        .collect::<Vec<_>>()
                });
                for (end, correction) in corrections.into_iter().flatten() {
                    positions[end] += correction;
                }
            } else {
                for (tether, lambda) in tethers.iter().zip(lambdas.iter_mut()) {
                    project(tether, lambda, positions, inverse_masses, alpha);
                }
            }
        }
    }
}

/// Projects `tether` and returns the change of its multiplier.
#[inline]
fn project(
    tether: &Tether,
    lambda: &mut Scalar,
    positions: &mut [Vector],
    inverse_masses: &[Scalar],
    alpha: Scalar,
) -> Scalar {
    let (direction, offset) = tether.delta(positions, inverse_masses);
    let delta_lambda = (offset - alpha * *lambda) / (1.0 + alpha);
    positions[tether.end] += delta_lambda * direction;
    *lambda += delta_lambda;
    delta_lambda
}
