//! Exact rational time bases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A time base or frame rate, `num / den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        f64::from(self.num) / f64::from(self.den)
    }

    /// Non-zero numerator and denominator.
    pub fn is_valid(self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Convert `value` expressed in `from` units into `to` units.
    ///
    /// Rounds to nearest with ties away from zero. A degenerate target
    /// (zero numerator) or source (zero denominator) returns `value`.
    pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
        let mut n = i128::from(value) * i128::from(from.num) * i128::from(to.den);
        let mut d = i128::from(from.den) * i128::from(to.num);
        if d == 0 {
            return value;
        }
        if d < 0 {
            n = -n;
            d = -d;
        }
        let q = n / d;
        let r = n % d;
        let rounded = if 2 * r.abs() >= d { q + n.signum() } else { q };
        rounded.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Presentation timestamp of `index` at `frame_rate`, in `time_base` units.
pub fn frame_to_pts(index: u64, frame_rate: Rational, time_base: Rational) -> i64 {
    let index = i64::try_from(index).unwrap_or(i64::MAX);
    Rational::rescale(index, frame_rate.invert(), time_base)
}

/// Nearest frame index for `pts`, clamped at zero.
pub fn pts_to_frame(pts: i64, time_base: Rational, frame_rate: Rational) -> u64 {
    Rational::rescale(pts, time_base, frame_rate.invert()).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        let half = Rational::new(1, 2);
        let one = Rational::new(1, 1);
        assert_eq!(Rational::rescale(1, half, one), 1);
        assert_eq!(Rational::rescale(-1, half, one), -1);
        assert_eq!(Rational::rescale(3, Rational::new(1, 4), one), 1);
        assert_eq!(Rational::rescale(1, Rational::new(1, 4), one), 0);
    }

    #[test]
    fn ntsc_frames_map_back_to_their_index() {
        let fps = Rational::new(30000, 1001);
        let tb = Rational::new(1, 90000);
        for index in [0u64, 1, 29, 30, 1799, 107_892] {
            let pts = frame_to_pts(index, fps, tb);
            assert_eq!(pts_to_frame(pts, tb, fps), index);
        }
        assert_eq!(frame_to_pts(1, fps, tb), 3003);
    }

    #[test]
    fn degenerate_bases_do_not_panic() {
        assert_eq!(Rational::rescale(42, Rational::new(1, 0), Rational::new(1, 1)), 42);
        assert_eq!(Rational::rescale(42, Rational::new(1, 1), Rational::new(0, 1)), 42);
        assert_eq!(Rational::default().as_f64(), 0.0);
    }

    proptest! {
        #[test]
        fn rescale_is_monotonic(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            let from = Rational::new(1, 30);
            let to = Rational::new(1, 1000);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(Rational::rescale(lo, from, to) <= Rational::rescale(hi, from, to));
            prop_assert!(Rational::rescale(lo, to, from) <= Rational::rescale(hi, to, from));
        }
    }
}
