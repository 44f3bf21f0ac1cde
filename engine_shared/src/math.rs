//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It covers only the 2-D vectors the world simulation needs: integer
//! chunk-local/grid coordinates and floating-point velocities.

use serde::{Deserialize, Serialize};

/// Integer 2-D vector, used for chunk-local positions and grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct IVec2 {
    pub x: i32,
    pub y: i32,
}

impl IVec2 {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }

    /// Component-wise Euclidean remainder, always non-negative.
    pub fn rem_euclid(self, modulus: Self) -> Self {
        Self::new(self.x.rem_euclid(modulus.x), self.y.rem_euclid(modulus.y))
    }

    /// Component-wise floor division.
    pub fn div_euclid(self, divisor: Self) -> Self {
        Self::new(self.x.div_euclid(divisor.x), self.y.div_euclid(divisor.y))
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self::new(self.x.clamp(min.x, max.x), self.y.clamp(min.y, max.y))
    }
}

/// Floating-point 2-D vector, used for velocities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct FVec2 {
    pub x: f64,
    pub y: f64,
}

impl FVec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Full-length component-wise addition.
    ///
    /// The reference implementation this is grounded on iterates `0..len-1`,
    /// leaving the last component untouched; that's a bug, not a
    /// convention, so both components are added here.
    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }

    pub fn scale(self, scalar: f64) -> Self {
        Self::new(self.x * scalar, self.y * scalar)
    }

    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ivec2_add_sub_roundtrip() {
        let a = IVec2::new(3, -2);
        let b = IVec2::new(1, 5);
        assert_eq!(a.add(b).sub(b), a);
    }

    #[test]
    fn ivec2_rem_euclid_stays_non_negative() {
        let v = IVec2::new(-1, -5);
        let m = IVec2::new(10, 10);
        let r = v.rem_euclid(m);
        assert!(r.x >= 0 && r.x < 10);
        assert!(r.y >= 0 && r.y < 10);
    }

    #[test]
    fn fvec2_add_is_full_length() {
        // Regression test for the reference's off-by-one vector-add bug:
        // both components must change, not just the first.
        let a = FVec2::new(1.0, 1.0);
        let b = FVec2::new(2.0, 3.0);
        let sum = a.add(b);
        assert_eq!(sum, FVec2::new(3.0, 4.0));
    }

    #[test]
    fn fvec2_scale() {
        let v = FVec2::new(2.0, -3.0);
        assert_eq!(v.scale(2.0), FVec2::new(4.0, -6.0));
    }
}
