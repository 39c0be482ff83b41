//! Applies forces and velocities to particles in order to move them according to the equations of motion
//! using numerical integration.
//!
//! This acts as a prediction for the next positions of the particles. The [solver](crate::dynamics::solver)
//! corrects these predicted positions to take constraints like tethers and joints into account,
//! and [`reconcile_velocity`] derives the final velocities from the corrected positions.
//!
//! Currently, only the [semi-implicit (symplectic) Euler](semi_implicit_euler) integration scheme
//! is supported.

#[doc(alias = "symplectic_euler")]
pub mod semi_implicit_euler;

use crate::{math::*, particles::ParticleStore};

use semi_implicit_euler::{integrate_position, integrate_velocity};

/// Predicts the position of every live particle after `delta_seconds`.
///
/// Dynamic particles are accelerated by gravity and their accumulated external force, then damped.
/// Kinematic particles with a target move exactly onto it, and take the velocity needed to get there.
/// Kinematic particles without a target keep moving with their current velocity.
pub fn predict_positions(
    store: &mut ParticleStore,
    gravity: Vector,
    linear_damping: Scalar,
    delta_seconds: Scalar,
) {
    for slot in 0..store.slot_count() {
        if !store.is_alive(slot) {
            continue;
        }

        let position = store.positions[slot];
        if store.flags[slot].is_kinematic() {
            if let Some(target) = store.kinematic_targets[slot] {
                store.velocities[slot] = reconcile_velocity(position, target, delta_seconds);
                store.predicted_positions[slot] = target;
                continue;
            }
        } else {
            integrate_velocity(
                &mut store.velocities[slot],
                store.forces[slot],
                store.inverse_masses[slot],
                gravity,
                linear_damping,
                delta_seconds,
            );
        }

        store.predicted_positions[slot] =
            integrate_position(position, store.velocities[slot], delta_seconds);
    }
}

/// Computes the velocity that moved a particle from `previous` to `current` in `delta_seconds`.
#[inline]
pub fn reconcile_velocity(previous: Vector, current: Vector, delta_seconds: Scalar) -> Vector {
    if delta_seconds > 0.0 {
        (current - previous) / delta_seconds
    } else {
        Vector::ZERO
    }
}
