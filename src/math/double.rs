use bevy::math::DVec3;

/// The vector type used by the solver.
pub type Vector = DVec3;

/// The floating point type used by the solver.
pub type Scalar = f64;
