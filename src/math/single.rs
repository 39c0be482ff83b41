use bevy::math::Vec3;

/// The vector type used by the solver.
pub type Vector = Vec3;

/// The floating point type used by the solver.
pub type Scalar = f32;
