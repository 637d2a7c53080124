//! Fixed-point numerics shared by both sides of the scheduler
//!
//! The kernel never touches floating point. CPU shares travel as parts per
//! million and the fairness ratio travels as the "justice" metric, the ratio
//! scaled by 1000 and truncated.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Scale of [`CpuShare`] (parts per million)
pub const SHARE_SCALE: u32 = 1_000_000;

/// Scale of [`Justice`] (ratio × 1000)
pub const JUSTICE_SCALE: u32 = 1_000;

/// Reasons a CPU share is refused
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShareError {
    /// Zero or negative share
    NotPositive,
    /// Share above 1.0
    AboveOne,
    /// NaN or infinite fraction
    NotFinite,
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPositive => write!(f, "CPU share must be greater than zero"),
            Self::AboveOne => write!(f, "CPU share must not exceed 1.0"),
            Self::NotFinite => write!(f, "CPU share is not a finite number"),
        }
    }
}

/// Guaranteed CPU share, a fraction in (0, 1] stored in parts per million
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CpuShare(u32);

impl CpuShare {
    /// The whole CPU
    pub const FULL: Self = Self(SHARE_SCALE);

    /// Build from parts per million, rejecting values outside (0, 1]
    pub const fn from_ppm(ppm: u32) -> Result<Self, ShareError> {
        if ppm == 0 {
            Err(ShareError::NotPositive)
        } else if ppm > SHARE_SCALE {
            Err(ShareError::AboveOne)
        } else {
            Ok(Self(ppm))
        }
    }

    /// Build from a fraction, rounded to the nearest part per million
    pub fn from_fraction(fraction: f64) -> Result<Self, ShareError> {
        if !fraction.is_finite() {
            return Err(ShareError::NotFinite);
        }
        if fraction <= 0.0 {
            return Err(ShareError::NotPositive);
        }
        if fraction > 1.0 {
            return Err(ShareError::AboveOne);
        }
        // fraction is in (0, 1] so the product fits comfortably in u32
        Self::from_ppm((fraction * SHARE_SCALE as f64 + 0.5) as u32)
    }

    /// Parts per million
    pub const fn ppm(self) -> u32 {
        self.0
    }

    /// Share as a fraction (for reporting only)
    pub fn as_fraction(self) -> f64 {
        self.0 as f64 / SHARE_SCALE as f64
    }

    /// Whole ticks this share is entitled to over `elapsed` ticks
    pub const fn entitled(self, elapsed: u64) -> u64 {
        ((self.0 as u128 * elapsed as u128) / SHARE_SCALE as u128) as u64
    }
}

impl TryFrom<u32> for CpuShare {
    type Error = ShareError;

    fn try_from(ppm: u32) -> Result<Self, Self::Error> {
        Self::from_ppm(ppm)
    }
}

impl From<CpuShare> for u32 {
    fn from(share: CpuShare) -> u32 {
        share.0
    }
}

impl fmt::Display for CpuShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / SHARE_SCALE, self.0 % SHARE_SCALE)
    }
}

/// Fairness ratio scaled by 1000 and truncated
///
/// `1000` means the process received exactly its entitlement, lower values
/// mean it is owed CPU, higher values mean it ran ahead of its share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Justice(pub u32);

impl Justice {
    /// Ratio of exactly 1.0
    pub const NEUTRAL: Self = Self(JUSTICE_SCALE);

    /// Compute the justice of `used` ticks against `share` over `elapsed` ticks.
    ///
    /// `elapsed == 0` counts as one tick. While the entitlement is below one
    /// whole tick (a process that just started) the result is neutral. The
    /// ratio itself is computed exactly from the share in parts per million,
    /// so a share of 0.5 over 1000 ticks with 300 used yields exactly 600.
    pub fn from_usage(used: u64, share: CpuShare, elapsed: u64) -> Self {
        let elapsed = elapsed.max(1);
        if share.entitled(elapsed) == 0 {
            return Self::NEUTRAL;
        }
        let numerator = used as u128 * JUSTICE_SCALE as u128 * SHARE_SCALE as u128;
        let denominator = share.ppm() as u128 * elapsed as u128;
        let value = numerator / denominator;
        Self(value.min(u32::MAX as u128) as u32)
    }

    /// Scaled value
    pub const fn milli(self) -> u32 {
        self.0
    }

    /// Distance from the neutral value, in thousandths
    pub const fn deviation(self) -> u32 {
        self.0.abs_diff(JUSTICE_SCALE)
    }

    /// Ratio as a fraction (for reporting only)
    pub fn as_ratio(self) -> f64 {
        self.0 as f64 / JUSTICE_SCALE as f64
    }
}

impl fmt::Display for Justice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.0 / JUSTICE_SCALE, self.0 % JUSTICE_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_share_bounds() {
        assert_eq!(CpuShare::from_ppm(0), Err(ShareError::NotPositive));
        assert_eq!(CpuShare::from_ppm(SHARE_SCALE + 1), Err(ShareError::AboveOne));
        assert_eq!(CpuShare::from_ppm(SHARE_SCALE), Ok(CpuShare::FULL));
        assert_eq!(CpuShare::from_fraction(f64::NAN), Err(ShareError::NotFinite));
        assert_eq!(CpuShare::from_fraction(-0.1), Err(ShareError::NotPositive));
        assert_eq!(CpuShare::from_fraction(1.5), Err(ShareError::AboveOne));
        assert_eq!(CpuShare::from_fraction(0.5).unwrap().ppm(), 500_000);
    }

    #[test]
    fn test_tiny_fraction_rejected() {
        // rounds to zero parts per million
        assert_eq!(CpuShare::from_fraction(1e-9), Err(ShareError::NotPositive));
    }

    #[test]
    fn test_justice_owed() {
        let share = CpuShare::from_fraction(0.5).unwrap();
        assert_eq!(share.entitled(1000), 500);
        assert_eq!(Justice::from_usage(300, share, 1000), Justice(600));
    }

    #[test]
    fn test_justice_ahead() {
        let share = CpuShare::from_fraction(0.5).unwrap();
        assert_eq!(Justice::from_usage(800, share, 1000), Justice(1600));
    }

    #[test]
    fn test_justice_new_process_is_neutral() {
        let share = CpuShare::from_fraction(0.01).unwrap();
        assert_eq!(Justice::from_usage(1, share, 0), Justice::NEUTRAL);
        assert_eq!(Justice::from_usage(5, share, 50), Justice::NEUTRAL);
    }

    #[test]
    fn test_justice_saturates() {
        let share = CpuShare::from_ppm(1).unwrap();
        assert_eq!(Justice::from_usage(u64::MAX, share, 1_000_000), Justice(u32::MAX));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Justice(1600)), "1.600");
        assert_eq!(format!("{}", CpuShare::from_ppm(250_000).unwrap()), "0.250000");
    }

    proptest! {
        #[test]
        fn prop_justice_is_deterministic(used in 0u64..1 << 40, ppm in 1u32..=SHARE_SCALE, elapsed in 0u64..1 << 40) {
            let share = CpuShare::from_ppm(ppm).unwrap();
            prop_assert_eq!(
                Justice::from_usage(used, share, elapsed),
                Justice::from_usage(used, share, elapsed)
            );
        }

        #[test]
        fn prop_full_usage_of_full_share_is_neutral(elapsed in 1u64..1 << 40) {
            prop_assert_eq!(Justice::from_usage(elapsed, CpuShare::FULL, elapsed), Justice::NEUTRAL);
        }
    }
}
