//! Extended Position-Based Dynamics (XPBD) constraint functionality.
//!
//! XPBD is a simulation method that solves constraints at the position-level.
//! The solver uses it for [tethers](super::tether), [distance joints](super::joints::DistanceJoint)
//! and [suspensions](super::joints::Suspension).
//!
//! ## Theory
//!
//! ### Constraint functions
//!
//! Each constraint has a *constraint function* `C(x)` that takes the state of the particles as parameters
//! and outputs a scalar value. For *equality constraints* the constraint tries to drive `C(x)` to zero.
//! For a distance constraint, the constraint function would be `C(x) = distance - rest_distance`.
//!
//! For *inequality constraints* such as tethers, the constraint is only applied when it is violated.
//! A tether only pulls its particle back once it is farther from its anchor than the reference length.
//!
//! ### Lagrange multipliers
//!
//! A Lagrange multiplier `λ` corresponds to the signed magnitude of the constraint force.
//! In XPBD, the update `Δλ` during a sub-iteration is computed as
//!
//! ```text
//! Δλ = (-C - α̃ * λ) / (sum(w_i * |▽C_i|^2) + α̃),    α̃ = α / h^2
//! ```
//!
//! where `w_i` is the inverse mass of particle `i`, `▽C_i` its constraint gradient,
//! `α` the constraint's compliance (inverse of stiffness) and `h` the step size.
//! Using `α = 0` corresponds to infinite stiffness.
//!
//! The accumulated `λ` is reset to zero at the start of each step and summed over every
//! sub-iteration within that step. This is what makes the response of a compliant constraint
//! independent of the iteration count and the step size, unlike plain PBD.
//!
//! ### Solving constraints
//!
//! The positional correction of particle `i` is
//!
//! ```text
//! Δx_i = Δλ * w_i * ▽C_i
//! ```
//!
//! and the force the constraint applied over the step is `λ * ▽C / h^2`.

use crate::math::*;

/// Computes how much a constraint's [Lagrange multiplier](self#lagrange-multipliers) changes when projecting
/// the constraint for all participating particles. The constraint gradients are assumed to be unit-length.
///
/// `c` is a scalar value returned by the [constraint function](self#constraint-functions).
/// When it is zero, the constraint is satisfied.
pub fn compute_lagrange_update(
    lagrange: Scalar,
    c: Scalar,
    inverse_masses: &[Scalar],
    compliance: Scalar,
    dt: Scalar,
) -> Scalar {
    // Compute the sum of all inverse masses.
    // The gradients are unit length, so they don't need to be considered.
    let w_sum: Scalar = inverse_masses.iter().copied().sum();

    // Avoid division by zero
    if w_sum <= Scalar::EPSILON || dt <= 0.0 {
        return 0.0;
    }

    // tilde_a = a/h^2
    let tilde_compliance = compliance / dt.powi(2);

    (-c - tilde_compliance * lagrange) / (w_sum + tilde_compliance)
}

/// Converts an accumulated Lagrange multiplier along a unit gradient into a force.
#[inline]
pub fn lagrange_to_force(lagrange: Scalar, direction: Vector, dt: Scalar) -> Vector {
    if dt <= 0.0 {
        return Vector::ZERO;
    }
    direction * (lagrange / dt.powi(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rigid_constraint_closes_violation() {
        // Two equal particles, violation of 2: each moves by 1.
        let delta = compute_lagrange_update(0.0, 2.0, &[1.0, 1.0], 0.0, 1.0 / 60.0);
        assert_relative_eq!(delta, -1.0);
    }

    #[test]
    fn static_particles_get_no_update() {
        assert_eq!(compute_lagrange_update(0.0, 2.0, &[0.0, 0.0], 0.0, 0.016), 0.0);
        assert_eq!(compute_lagrange_update(0.0, 2.0, &[1.0], 0.0, 0.0), 0.0);
    }
}
