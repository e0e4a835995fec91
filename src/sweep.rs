//! Gate sweep values.

use serde::{Deserialize, Serialize};

use crate::boundary::Boundary;
use crate::error::{AppResult, TuningError};

/// Values from `start` toward `stop` in steps of `|step|`, excluding `stop`.
///
/// The direction always follows `start -> stop`; the sign of `step` is ignored.
/// `permissive_range(0.0, -10.0, 4.0)` gives `[0.0, -4.0, -8.0]`.
pub fn permissive_range(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if step == 0.0 || !step.is_finite() {
        return Err(TuningError::InvalidScanJob(format!(
            "sweep step must be finite and non-zero, got {step}"
        )));
    }
    if !start.is_finite() || !stop.is_finite() {
        return Err(TuningError::InvalidScanJob(format!(
            "sweep range must be finite, got ({start}, {stop})"
        )));
    }

    let signed_step = if stop > start { step.abs() } else { -step.abs() };
    let count = ((stop - start) / signed_step).ceil().max(0.0) as usize;
    Ok((0..count).map(|i| start + i as f64 * signed_step).collect())
}

/// `count` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + i as f64 * step).collect()
        }
    }
}

/// Values a gate will be swept over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepValues {
    gate: String,
    values: Vec<f64>,
}

impl SweepValues {
    /// Build a sweep with [`permissive_range`] and check it against `bounds`.
    pub fn new(
        gate: &str,
        start: f64,
        end: f64,
        step: f64,
        bounds: Option<Boundary>,
    ) -> AppResult<Self> {
        Self::from_values(gate, permissive_range(start, end, step)?, bounds)
    }

    /// Wrap explicit values, rejecting any outside `bounds`.
    pub fn from_values(gate: &str, values: Vec<f64>, bounds: Option<Boundary>) -> AppResult<Self> {
        if let Some(bounds) = bounds {
            for value in &values {
                bounds.check(gate, *value)?;
            }
        }
        Ok(Self {
            gate: gate.to_string(),
            values,
        })
    }

    /// Swept gate
    pub fn gate(&self) -> &str {
        &self.gate
    }

    /// Sweep values in order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the sweep has no points
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the values
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }
}
