use std::fmt;

use serde::{Deserialize, Serialize};

/// Affine description of a serialized size, `slope * x + constant`.
///
/// Codecs report one of these when their encoded size is either constant or
/// a multiple of some step plus a fixed overhead. Summing the equations of a
/// key and a value yields an equation for a whole entry whose slope is the
/// gcd of the parts; it no longer recovers individual sizes, but every entry
/// size is still expressible with it, which is all offset compression needs.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeEquation {
    slope: i64,
    constant: i64,
}

impl SizeEquation {
    /// Equation with an explicit slope and intercept.
    pub const fn slope_intercept(slope: i64, constant: i64) -> Self {
        Self { slope, constant }
    }

    /// Equation for sizes that never change: `0 * x + value`.
    pub const fn constant_value(value: i64) -> Self {
        Self::slope_intercept(0, value)
    }

    /// Equation for sizes that are any multiple of `slope`.
    pub const fn multiple_of(slope: i64) -> Self {
        Self::slope_intercept(slope, 0)
    }

    pub fn slope(&self) -> i64 {
        self.slope
    }

    pub fn constant(&self) -> i64 {
        self.constant
    }

    pub fn is_constant(&self) -> bool {
        self.slope == 0
    }

    /// Combines two equations: the slopes fold into their gcd and the
    /// constants add up.
    pub fn add(&self, other: &SizeEquation) -> SizeEquation {
        SizeEquation::slope_intercept(gcd(self.slope, other.slope), self.constant + other.constant)
    }

    /// Equation for `n` independent repetitions of this one.
    pub fn repeat(&self, n: i64) -> SizeEquation {
        SizeEquation::slope_intercept(self.slope, self.constant * n)
    }

    pub fn apply(&self, x: i64) -> i64 {
        self.slope * x + self.constant
    }

    /// Solves `y = slope * x + constant` for `x`, treating a zero slope as one.
    pub fn solve_for(&self, y: i64) -> i64 {
        (y - self.constant) / self.divisor()
    }

    /// Like [`apply`](Self::apply) with the constant counted `n` times.
    pub fn apply_nth(&self, x: i64, n: i64) -> i64 {
        self.slope * x + self.constant * n
    }

    /// Like [`solve_for`](Self::solve_for) with the constant counted `n` times.
    pub fn solve_for_nth(&self, y: i64, n: i64) -> i64 {
        (y - self.constant * n) / self.divisor()
    }

    /// Whether some non-negative `x` satisfies `apply(x) == size`.
    pub fn admits(&self, size: i64) -> bool {
        if self.slope == 0 {
            size == self.constant
        } else {
            let rest = size - self.constant;
            rest >= 0 && rest % self.slope == 0
        }
    }

    fn divisor(&self) -> i64 {
        if self.slope == 0 {
            1
        } else {
            self.slope
        }
    }
}

impl fmt::Display for SizeEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x + {}", self.slope, self.constant)
    }
}

/// Greatest common divisor of the absolute values, with `gcd(0, 0) == 0`.
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality() {
        assert_eq!(SizeEquation::constant_value(8), SizeEquation::slope_intercept(0, 8));
        assert_eq!(SizeEquation::multiple_of(3), SizeEquation::slope_intercept(3, 0));
        assert_ne!(SizeEquation::constant_value(8), SizeEquation::multiple_of(8));
        assert!(SizeEquation::constant_value(8).is_constant());
        assert!(!SizeEquation::multiple_of(1).is_constant());
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(0, 0), 0);
        assert_eq!(gcd(0, 7), 7);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(-12, 18), 6);
        assert_eq!(gcd(17, 5), 1);
    }

    #[test]
    fn test_add_and_repeat() {
        let long = SizeEquation::constant_value(8);
        let vlong = SizeEquation::multiple_of(1);
        assert_eq!(long.add(&long), SizeEquation::constant_value(16));
        assert_eq!(long.add(&vlong), SizeEquation::slope_intercept(1, 8));
        assert_eq!(
            SizeEquation::slope_intercept(4, 1).add(&SizeEquation::slope_intercept(6, 2)),
            SizeEquation::slope_intercept(2, 3)
        );
        assert_eq!(long.repeat(20), SizeEquation::constant_value(160));
        assert_eq!(long.repeat(20).apply(0), 160);
    }

    #[test]
    fn test_solve() {
        let eq = SizeEquation::slope_intercept(3, 2);
        for x in 0..100 {
            assert_eq!(eq.solve_for(eq.apply(x)), x);
            assert_eq!(eq.solve_for_nth(eq.apply_nth(x, 5), 5), x);
        }
        let fixed = SizeEquation::constant_value(8);
        assert_eq!(fixed.solve_for(8), 0);
        assert_eq!(fixed.apply_nth(0, 10), 80);
        assert_eq!(fixed.solve_for_nth(80, 10), 0);
    }

    #[test]
    fn test_admits() {
        assert!(SizeEquation::constant_value(8).admits(8));
        assert!(!SizeEquation::constant_value(8).admits(9));
        assert!(SizeEquation::slope_intercept(1, 8).admits(8));
        assert!(SizeEquation::slope_intercept(1, 8).admits(100));
        assert!(!SizeEquation::slope_intercept(1, 8).admits(7));
        assert!(SizeEquation::slope_intercept(4, 2).admits(10));
        assert!(!SizeEquation::slope_intercept(4, 2).admits(11));
    }
}
