//! Closed voltage ranges used as gate and channel limits.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, TuningError};

/// Closed interval `[low, high]` of allowed values.
///
/// A `Boundary` can only be created with `low <= high`, so every instance
/// in the crate is a valid, non-decreasing range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct Boundary {
    low: f64,
    high: f64,
}

impl Boundary {
    /// Create a boundary for `target`, rejecting `low > high` and NaN bounds.
    pub fn for_gate(target: &str, low: f64, high: f64) -> AppResult<Self> {
        if low.is_nan() || high.is_nan() || low > high {
            return Err(TuningError::InvalidBoundary {
                gate: target.to_string(),
                low,
                high,
            });
        }
        Ok(Self { low, high })
    }

    /// Create an anonymous boundary.
    pub fn new(low: f64, high: f64) -> AppResult<Self> {
        Self::for_gate("<unnamed>", low, high)
    }

    /// Lower bound.
    pub fn low(&self) -> f64 {
        self.low
    }

    /// Upper bound.
    pub fn high(&self) -> f64 {
        self.high
    }

    /// Whether `value` lies inside the closed range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }

    /// Intersection of two ranges, `None` when they do not overlap.
    pub fn intersect(&self, other: &Boundary) -> Option<Boundary> {
        let low = self.low.max(other.low);
        let high = self.high.min(other.high);
        (low <= high).then_some(Boundary { low, high })
    }

    /// Check `value` against the range and name `target` in the error.
    pub fn check(&self, target: &str, value: f64) -> AppResult<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(TuningError::OutOfBounds {
                target: target.to_string(),
                value,
                low: self.low,
                high: self.high,
            })
        }
    }
}

impl TryFrom<(f64, f64)> for Boundary {
    type Error = TuningError;

    fn try_from((low, high): (f64, f64)) -> Result<Self, Self::Error> {
        Boundary::new(low, high)
    }
}

impl From<Boundary> for (f64, f64) {
    fn from(value: Boundary) -> Self {
        (value.low, value.high)
    }
}
