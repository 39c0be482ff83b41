//! Math types and traits used by the crate.
//!
//! The scalar and vector types are feature-dependent, so they will be different for `f32` and `f64`.

#[cfg(feature = "f32")]
mod single;
#[cfg(feature = "f32")]
pub use single::*;

#[cfg(feature = "f64")]
mod double;
#[cfg(feature = "f64")]
pub use double::*;

use bevy::math::*;

/// Adjust the precision of the math construct to the precision chosen for compilation.
pub trait AdjustPrecision {
    /// A math construct type with the desired precision.
    type Adjusted;
    /// Adjusts the precision of [`self`] to [`Self::Adjusted`](#associatedtype.Adjusted).
    fn adjust_precision(&self) -> Self::Adjusted;
}

impl AdjustPrecision for f32 {
    type Adjusted = Scalar;
    fn adjust_precision(&self) -> Self::Adjusted {
        *self as Scalar
    }
}

impl AdjustPrecision for Vec3 {
    type Adjusted = Vector;
    #[cfg(feature = "f32")]
    fn adjust_precision(&self) -> Self::Adjusted {
        *self
    }
    #[cfg(feature = "f64")]
    fn adjust_precision(&self) -> Self::Adjusted {
        self.as_dvec3()
    }
}

/// Adjust the precision down to `f32` regardless of compilation.
pub trait AsF32 {
    /// The `f32` version of a math construct.
    type F32;
    /// Returns the `f32` version of this type.
    fn f32(&self) -> Self::F32;
}

impl AsF32 for DVec3 {
    type F32 = Vec3;
    fn f32(&self) -> Self::F32 {
        self.as_vec3()
    }
}

impl AsF32 for Vec3 {
    type F32 = Self;
    fn f32(&self) -> Self::F32 {
        *self
    }
}

/// An extension trait for computing reciprocals without division by zero.
pub trait RecipOrZero {
    /// Computes the reciprocal of `self` if `self` is not zero,
    /// and returns zero otherwise to avoid division by zero.
    fn recip_or_zero(self) -> Self;
}

impl RecipOrZero for f32 {
    fn recip_or_zero(self) -> Self {
        if self != 0.0 { self.recip() } else { 0.0 }
    }
}

impl RecipOrZero for f64 {
    fn recip_or_zero(self) -> Self {
        if self != 0.0 { self.recip() } else { 0.0 }
    }
}

/// Splits `vector` into a unit direction and its length.
///
/// Degenerate vectors produce a zero direction and a zero length instead of NaN.
#[inline]
#[must_use]
pub fn direction_and_length(vector: Vector) -> (Vector, Scalar) {
    let length = vector.length();
    if length > Scalar::EPSILON && length.is_finite() {
        (vector / length, length)
    } else {
        (Vector::ZERO, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_direction_is_zero() {
        let (direction, length) = direction_and_length(Vector::ZERO);
        assert_eq!(direction, Vector::ZERO);
        assert_eq!(length, 0.0);

        let (direction, length) = direction_and_length(Vector::new(0.0, 3.0, 4.0));
        assert_eq!(length, 5.0);
        assert!((direction.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn recip_or_zero_handles_zero() {
        assert_eq!(0.0_f32.recip_or_zero(), 0.0);
        assert_eq!(4.0_f64.recip_or_zero(), 0.25);
    }
}
