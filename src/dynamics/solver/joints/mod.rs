//! Compliant XPBD distance constraints attached to particles.
//!
//! - [`DistanceJoint`]: keeps two particles at a rest distance.
//! - [`Suspension`]: pulls a particle towards a target point in world space, like a spring.
//!
//! Both accumulate a Lagrange multiplier over the passes of a step,
//! which is reported back to the producer as a constraint force.

use super::xpbd::{compute_lagrange_update, lagrange_to_force};
use crate::math::*;

/// A compliant distance constraint between two particles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistanceJoint {
    /// The first particle.
    pub a: usize,
    /// The second particle.
    pub b: usize,
    /// The distance the joint tries to keep.
    pub rest_length: Scalar,
    /// The inverse of stiffness. Zero is rigid.
    pub compliance: Scalar,
    lagrange: Scalar,
    direction: Vector,
}

impl DistanceJoint {
    /// Creates a new [`DistanceJoint`].
    pub const fn new(a: usize, b: usize, rest_length: Scalar, compliance: Scalar) -> Self {
        Self {
            a,
            b,
            rest_length,
            compliance,
            lagrange: 0.0,
            direction: Vector::ZERO,
        }
    }

    /// Resets the accumulated Lagrange multiplier.
    pub fn clear_lagrange(&mut self) {
        self.lagrange = 0.0;
    }

    /// Returns the Lagrange multiplier accumulated during the current step.
    pub fn lagrange(&self) -> Scalar {
        self.lagrange
    }

    /// Projects the joint once.
    pub fn solve(&mut self, positions: &mut [Vector], inverse_masses: &[Scalar], dt: Scalar) {
        let (wa, wb) = (inverse_masses[self.a], inverse_masses[self.b]);
        let (direction, distance) = direction_and_length(positions[self.b] - positions[self.a]);
        if direction == Vector::ZERO {
            return;
        }

        let c = distance - self.rest_length;
        let delta_lagrange = compute_lagrange_update(self.lagrange, c, &[wa, wb], self.compliance, dt);
        self.lagrange += delta_lagrange;
        self.direction = direction;

        let impulse = delta_lagrange * direction;
        positions[self.a] -= impulse * wa;
        positions[self.b] += impulse * wb;
    }

    /// Returns the force the joint applied to `b` during the last step.
    pub fn force(&self, dt: Scalar) -> Vector {
        lagrange_to_force(self.lagrange, self.direction, dt)
    }
}

/// A compliant spring between a particle and a target point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Suspension {
    /// The suspended particle.
    pub particle: usize,
    /// The world-space point the particle hangs from.
    pub target: Vector,
    /// The distance the spring tries to keep.
    pub rest_length: Scalar,
    /// The inverse of stiffness. Zero is rigid.
    pub compliance: Scalar,
    lagrange: Scalar,
    direction: Vector,
}

impl Suspension {
    /// Creates a new [`Suspension`].
    pub const fn new(
        particle: usize,
        target: Vector,
        rest_length: Scalar,
        compliance: Scalar,
    ) -> Self {
        Self {
            particle,
            target,
            rest_length,
            compliance,
            lagrange: 0.0,
            direction: Vector::ZERO,
        }
    }

    /// Resets the accumulated Lagrange multiplier.
    pub fn clear_lagrange(&mut self) {
        self.lagrange = 0.0;
    }

    /// Returns the Lagrange multiplier accumulated during the current step.
    pub fn lagrange(&self) -> Scalar {
        self.lagrange
    }

    /// Projects the spring once.
    pub fn solve(&mut self, positions: &mut [Vector], inverse_masses: &[Scalar], dt: Scalar) {
        let w = inverse_masses[self.particle];
        let (direction, distance) = direction_and_length(positions[self.particle] - self.target);
        if direction == Vector::ZERO {
            return;
        }

        let c = distance - self.rest_length;
        let delta_lagrange = compute_lagrange_update(self.lagrange, c, &[w], self.compliance, dt);
        self.lagrange += delta_lagrange;
        self.direction = direction;

        positions[self.particle] += delta_lagrange * direction * w;
    }

    /// Returns the force the spring applied to the particle during the last step.
    pub fn force(&self, dt: Scalar) -> Vector {
        lagrange_to_force(self.lagrange, self.direction, dt)
    }
}
