//! Scan-job descriptions.
//!
//! A [`ScanJob`] is plain data: which gate to step, which gate to sweep, over
//! which ranges, and which detectors to record. It is stored verbatim in the
//! metadata of every dataset a scan produces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, TuningError};

/// Default step size of [`create_scan_job`] (mV).
pub const DEFAULT_STEP: f64 = -1.0;

/// Range description for one scan axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepData {
    /// Candidate gates; the first is used unless `gate` is set
    #[serde(default)]
    pub gates: Vec<String>,
    /// Explicit gate, takes precedence over `gates`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    /// First value
    pub start: f64,
    /// End value (excluded)
    pub end: f64,
    /// Step size, only its magnitude is used
    pub step: f64,
}

impl SweepData {
    /// Range over a single gate
    pub fn new(gate: impl Into<String>, start: f64, end: f64, step: f64) -> Self {
        Self {
            gates: vec![gate.into()],
            gate: None,
            start,
            end,
            step,
        }
    }

    /// Gate this axis moves.
    pub fn primary_gate(&self) -> AppResult<&str> {
        self.gate
            .as_deref()
            .or_else(|| self.gates.first().map(String::as_str))
            .ok_or_else(|| TuningError::InvalidScanJob("sweep data names no gate".to_string()))
    }
}

/// Detector selection for a scan.
///
/// `Index(i)` is the legacy form and refers to the station detector `keithley{i}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementRef {
    /// Legacy Keithley index
    Index(u32),
    /// Detector name
    Name(String),
}

impl MeasurementRef {
    /// Station detector name this reference resolves to.
    pub fn detector_name(&self) -> String {
        match self {
            MeasurementRef::Index(idx) => format!("keithley{idx}"),
            MeasurementRef::Name(name) => name.clone(),
        }
    }
}

impl fmt::Display for MeasurementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detector_name())
    }
}

impl From<u32> for MeasurementRef {
    fn from(value: u32) -> Self {
        MeasurementRef::Index(value)
    }
}

impl From<&str> for MeasurementRef {
    fn from(value: &str) -> Self {
        MeasurementRef::Name(value.to_string())
    }
}

/// Description of a 1D or 2D scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    /// Outer (stepped) axis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stepdata: Option<SweepData>,
    /// Inner (swept) axis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweepdata: Option<SweepData>,
    /// Detectors to record
    #[serde(default, alias = "keithleyidx")]
    pub instrument: Vec<MeasurementRef>,
    /// Per-point delay in seconds, overrides the scan default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

impl ScanJob {
    /// 1D job sweeping `sweepdata`
    pub fn sweep(sweepdata: SweepData) -> Self {
        Self {
            sweepdata: Some(sweepdata),
            instrument: vec![MeasurementRef::Index(1)],
            ..Default::default()
        }
    }

    /// Replace the detector selection
    pub fn with_instrument(mut self, instrument: Vec<MeasurementRef>) -> Self {
        self.instrument = instrument;
        self
    }

    /// Set the per-point delay
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sweep axis, required by every scan.
    pub fn require_sweepdata(&self) -> AppResult<&SweepData> {
        self.sweepdata
            .as_ref()
            .ok_or_else(|| TuningError::InvalidScanJob("scan job has no sweepdata".to_string()))
    }

    /// Step axis, required by 2D scans.
    pub fn require_stepdata(&self) -> AppResult<&SweepData> {
        self.stepdata
            .as_ref()
            .ok_or_else(|| TuningError::InvalidScanJob("scan job has no stepdata".to_string()))
    }
}

/// Build a scan job stepping `g1` over `r1` and optionally sweeping `g2` over `r2`.
///
/// `step` defaults to [`DEFAULT_STEP`] and `instrument` to `[keithley1]`. When a
/// sweep gate is given without a range the sweep reuses `r1`.
pub fn create_scan_job(
    g1: &str,
    r1: (f64, f64),
    g2: Option<&str>,
    r2: Option<(f64, f64)>,
    step: Option<f64>,
    instrument: Option<Vec<MeasurementRef>>,
) -> ScanJob {
    let step = step.unwrap_or(DEFAULT_STEP);
    let sweepdata = g2.map(|g2| {
        let (start, end) = r2.unwrap_or(r1);
        SweepData::new(g2, start, end, step)
    });

    ScanJob {
        stepdata: Some(SweepData::new(g1, r1.0, r1.1, step)),
        sweepdata,
        instrument: instrument.unwrap_or_else(|| vec![MeasurementRef::Index(1)]),
        delay: None,
    }
}
