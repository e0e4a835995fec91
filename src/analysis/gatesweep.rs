//! Pinch-off extraction from a 1D gate sweep.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{dataset_1d_metadata, DataSet};
use crate::error::{AppResult, TuningError};

/// Fraction of the open-closed range defining the pinch-off level.
const PINCH_LEVEL: f64 = 0.1;
/// Minimum relative contrast of a working gate.
const MIN_CONTRAST: f64 = 0.5;
/// Half-width of the moving-average window.
const SMOOTH_HALF_WIDTH: usize = 2;

/// Result of [`analyse_gate_sweep`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSweepAnalysis {
    /// Swept gate
    pub gate: String,
    /// Gate voltage where the channel closes
    pub pinch_value: f64,
    /// Sample index closest to `pinch_value`, in scan order
    pub pinch_index: usize,
    /// Gate voltage at half conduction
    pub mid_point: f64,
    /// Signal level at half conduction
    pub mid_value: f64,
    /// Closed-channel level
    pub low_value: f64,
    /// Open-channel level
    pub high_value: f64,
    /// Whether the gate closes the channel
    pub good_gate: bool,
    /// Human-readable summary
    pub description: String,
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted {
        [] => f64::NAN,
        [only] => *only,
        _ => {
            let pos = q / 100.0 * (sorted.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

fn sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(f64::total_cmp);
    values
}

fn smooth(values: &[f64]) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(SMOOTH_HALF_WIDTH);
            let hi = (i + SMOOTH_HALF_WIDTH + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

/// Walk from the open (high-voltage) end down and return the fractional
/// position where `y` first falls below `level`.
fn crossing_from_open_side(x: &[f64], y: &[f64], level: f64) -> Option<f64> {
    for i in (1..y.len()).rev() {
        if y[i] >= level && y[i - 1] < level {
            let frac = (y[i] - level) / (y[i] - y[i - 1]);
            return Some(x[i] + frac * (x[i - 1] - x[i]));
        }
        if y[i] < level {
            return None;
        }
    }
    None
}

/// Extract pinch-off characteristics from a 1D sweep.
///
/// The closed level is the 1st percentile of the trace, the open level the
/// 90th percentile of the samples above the midpoint between closed level and
/// trace maximum. `minthr` raises the closed level to at least a noise floor
/// and `maxthr` caps the open level. The pinch-off value is where the smoothed
/// trace falls to `low + 0.1 * (high - low)` walking down from the open side.
pub fn analyse_gate_sweep(
    dataset: &DataSet,
    minthr: Option<f64>,
    maxthr: Option<f64>,
) -> AppResult<GateSweepAnalysis> {
    let meta = dataset_1d_metadata(dataset, None)?;
    let measured = dataset.array(&meta.arrayname)?;

    let mut points: Vec<(usize, f64, f64)> = meta
        .vsweep
        .iter()
        .zip(measured.data.iter())
        .enumerate()
        .filter(|(_, (x, y))| x.is_finite() && y.is_finite())
        .map(|(i, (x, y))| (i, *x, *y))
        .collect();
    if points.len() < 2 {
        return Err(TuningError::Analysis(format!(
            "sweep of {} has {} valid samples",
            meta.gate,
            points.len()
        )));
    }
    points.sort_by(|a, b| a.1.total_cmp(&b.1));

    let x: Vec<f64> = points.iter().map(|p| p.1).collect();
    let y: Vec<f64> = points.iter().map(|p| p.2).collect();
    let ys = smooth(&y);

    let all = sorted(y.iter().copied());
    let mut low = percentile(&all, 1.0);
    let top = percentile(&all, 100.0);
    let mid_level = (low + top) / 2.0;
    let open = sorted(y.iter().copied().filter(|v| *v >= mid_level));
    let mut high = percentile(&open, 90.0);

    if let Some(minthr) = minthr {
        low = low.max(minthr);
    }
    if let Some(maxthr) = maxthr {
        high = high.min(maxthr);
    }

    let contrast = if high.abs() > f64::EPSILON {
        (high - low) / high.abs()
    } else {
        0.0
    };
    let level = low + PINCH_LEVEL * (high - low);
    let mid_value = (low + high) / 2.0;
    let crossing = crossing_from_open_side(&x, &ys, level);
    let good_gate = high > low && contrast >= MIN_CONTRAST && crossing.is_some();

    let pinch_value = crossing.unwrap_or(x[0]);
    let mid_point = crossing_from_open_side(&x, &ys, mid_value).unwrap_or(pinch_value);

    let nearest = points
        .iter()
        .min_by(|a, b| (a.1 - pinch_value).abs().total_cmp(&(b.1 - pinch_value).abs()))
        .map_or(0, |p| p.0);

    let description = if good_gate {
        format!(
            "{}: pinch-off at {:.1} mV, half conduction at {:.1} mV",
            meta.gate, pinch_value, mid_point
        )
    } else {
        format!("{}: no clear pinch-off (contrast {:.2})", meta.gate, contrast)
    };
    debug!(gate = %meta.gate, pinch_value, mid_point, low, high, good_gate, "Gate sweep analysed");

    Ok(GateSweepAnalysis {
        gate: meta.gate,
        pinch_value,
        pinch_index: nearest,
        mid_point,
        mid_value,
        low_value: low,
        high_value: high,
        good_gate,
        description,
    })
}
