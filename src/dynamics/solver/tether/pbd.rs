use bevy::tasks::ParallelSlice;

use super::{TetherConstraints, should_parallelize};
use crate::{dynamics::solver::compute_task_pool, math::*};

/// Tethers projected with plain Position-Based Dynamics.
///
/// Each pass moves every end particle `stiffness * offset` towards its anchor.
/// A pass never increases the violation of a tether, and with a stiffness of one it
/// closes it completely.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PbdTethers {
    pub(crate) constraints: TetherConstraints,
}

impl PbdTethers {
    /// Creates a new [`PbdTethers`].
    pub fn new(constraints: TetherConstraints) -> Self {
        Self { constraints }
    }

    /// Returns the underlying tethers.
    pub fn constraints(&self) -> &TetherConstraints {
        &self.constraints
    }

    /// Runs one projection pass over every batch.
    pub fn apply(&self, positions: &mut [Vector], inverse_masses: &[Scalar], parallel: bool) {
        apply_with_stiffness(
            &self.constraints,
            self.constraints.stiffness(),
            positions,
            inverse_masses,
            parallel,
        );
    }
}

pub(super) fn apply_with_stiffness(
    constraints: &TetherConstraints,
    stiffness: Scalar,
    positions: &mut [Vector],
    inverse_masses: &[Scalar],
    parallel: bool,
) {
    if stiffness <= 0.0 {
        return;
    }

    for batch in constraints.batches() {
        let tethers = &constraints.tethers()[batch.clone()];

        if should_parallelize(tethers.len(), parallel) {
            let pool = compute_task_pool();
            let chunk_size = tethers.len().div_ceil(pool.thread_num().max(1));
            let shared: &[Vector] = positions;
            let corrections = tethers.par_chunk_map(pool, chunk_size, |_i, chunk| {
                chunk
                    .iter()
                    .map(|tether| {
                        let (direction, offset) = tether.delta(shared, inverse_masses);
                        (tether.end, stiffness * offset * direction)
                    })
                    .collect::<Vec<_>>()
            });
            for (end, correction) in corrections.into_iter().flatten() {
                positions[end] += correction;
            }
        } else {
            for tether in tethers {
                let (direction, offset) = tether.delta(positions, inverse_masses);
                positions[tether.end] += stiffness * offset * direction;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::solver::tether::Tether;
    use approx::assert_relative_eq;

    #[test]
    fn full_stiffness_moves_particle_to_reference_length() {
        let tethers = PbdTethers::new(TetherConstraints::new(vec![Tether::new(0, 1, 5.0)], 1.0));
        let mut positions = [Vector::ZERO, Vector::new(10.0, 0.0, 0.0)];
        tethers.apply(&mut positions, &[0.0, 1.0], false);
        assert_relative_eq!(positions[1].x, 5.0);
        assert_eq!(positions[1].y, 0.0);
        assert_eq!(positions[1].z, 0.0);
    }

    #[test]
    fn apply_never_increases_violation() {
        let tethers: Vec<Tether> = (1..8).map(|end| Tether::new(0, end, 0.5 * end as Scalar)).collect();
        let mut positions: Vec<Vector> = (0..8)
            .map(|i| Vector::new(i as Scalar * 1.3, (i % 3) as Scalar - 1.0, 0.25 * i as Scalar))
            .collect();
        let mut inverse_masses = vec![1.0; 8];
        inverse_masses[0] = 0.0;

        for stiffness in [0.0, 0.25, 0.5, 1.0] {
            let set = PbdTethers::new(TetherConstraints::new(tethers.clone(), stiffness));
            let before: Vec<Scalar> = tethers.iter().map(|t| t.offset(&positions)).collect();
            set.apply(&mut positions, &inverse_masses, false);
            for (tether, before) in tethers.iter().zip(before) {
                assert!(tether.offset(&positions) <= before + 1e-5);
            }
        }
    }

    #[test]
    fn slack_tether_does_not_push() {
        let tethers = PbdTethers::new(TetherConstraints::new(vec![Tether::new(0, 1, 5.0)], 1.0));
        let mut positions = [Vector::ZERO, Vector::new(2.0, 0.0, 0.0)];
        tethers.apply(&mut positions, &[0.0, 1.0], false);
        assert_eq!(positions[1], Vector::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn parallel_batch_matches_serial() {
        let count = 2 * super::super::MIN_PARALLEL_TETHERS;
        let tethers: Vec<Tether> = (1..=count).map(|end| Tether::new(0, end, 1.0)).collect();
        let set = PbdTethers::new(TetherConstraints::new(tethers, 0.7));
        let initial: Vec<Vector> = (0..=count)
            .map(|i| Vector::new(i as Scalar * 0.01, 3.0, -(i as Scalar) * 0.02))
            .collect();
        let mut inverse_masses = vec![1.0; count + 1];
        inverse_masses[0] = 0.0;

        let mut serial = initial.clone();
        set.apply(&mut serial, &inverse_masses, false);
        let mut parallel = initial;
        set.apply(&mut parallel, &inverse_masses, true);
        assert_eq!(serial, parallel);
    }
}
