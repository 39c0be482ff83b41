//! The *semi-implicit* or *symplectic* Euler [integration](super) scheme.
//!
//! [Semi-implicit Euler](https://en.wikipedia.org/wiki/Semi-implicit_Euler_method)
//! integration evaluates the acceleration at the current timestep and the velocity
//! at the next timestep:
//!
//! ```text
//! v = v_0 + a * Δt
//! x = x_0 + v * Δt
//! ```
//!
//! This order is opposite to explicit Euler integration, which uses the velocity
//! at the current timestep instead of the next timestep. The explicit approach
//! can lead to particles gaining energy over time.

use crate::math::*;

/// Integrates velocity based on the given force in order to find
/// the velocity after `delta_seconds` have passed.
///
/// Damping is applied after the acceleration as `v / (1 + Δt * c)`.
#[inline]
pub fn integrate_velocity(
    lin_vel: &mut Vector,
    force: Vector,
    inverse_mass: Scalar,
    gravity: Vector,
    linear_damping: Scalar,
    delta_seconds: Scalar,
) {
    // v = v_0 + a * Δt
    *lin_vel += linear_acceleration(force, inverse_mass, gravity) * delta_seconds;

    if linear_damping != 0.0 {
        *lin_vel /= 1.0 + delta_seconds * linear_damping;
    }
}

/// Integrates position based on the given velocity in order to
/// find the position after `delta_seconds` have passed.
#[inline]
pub fn integrate_position(pos: Vector, lin_vel: Vector, delta_seconds: Scalar) -> Vector {
    // x = x_0 + v * Δt
    pos + lin_vel * delta_seconds
}

/// Computes linear acceleration based on the given force and inverse mass.
///
/// Kinematic particles are not accelerated.
#[inline]
pub fn linear_acceleration(force: Vector, inverse_mass: Scalar, gravity: Vector) -> Vector {
    if inverse_mass > 0.0 {
        // Newton's 2nd law for the external force, plus gravity.
        gravity + force * inverse_mass
    } else {
        Vector::ZERO
    }
}
