//! Measurement station: gates, detectors and the background job handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::TuningConfig;
use crate::error::{AppResult, TuningError};
use crate::gates::VirtualDac;
use crate::instrument::{DacInstrument, DeviceModel, Readable, VirtualIvvi, VirtualKeithley};
use crate::run_engine::{BackgroundJobs, RunEngine};
use crate::scanjob::MeasurementRef;

/// Per-gate settle time in seconds.
pub type GateSettle = Arc<dyn Fn(&str) -> f64 + Send + Sync>;

/// Bounded poll used when waiting for a background measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundPoll {
    /// Number of polls before giving up
    pub attempts: u32,
    /// Sleep between polls
    pub interval: Duration,
}

impl Default for BackgroundPoll {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Gates and detectors of one setup.
///
/// The station owns the handle of its current background measurement, so two
/// stations never see each other's jobs.
pub struct Station {
    gates: Arc<VirtualDac>,
    detectors: IndexMap<String, Arc<dyn Readable>>,
    gate_settle: Option<GateSettle>,
    background: BackgroundJobs,
    measurement: RwLock<Vec<String>>,
    poll: BackgroundPoll,
}

impl fmt::Debug for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Station")
            .field("gates", &self.gates)
            .field("detectors", &self.detectors.keys().collect::<Vec<_>>())
            .field("gate_settle", &self.gate_settle.is_some())
            .field("measurement", &*self.measurement.read())
            .field("poll", &self.poll)
            .finish()
    }
}

impl Station {
    /// Station without detectors.
    pub fn new(gates: Arc<VirtualDac>) -> Self {
        Self {
            gates,
            detectors: IndexMap::new(),
            gate_settle: None,
            background: BackgroundJobs::new(),
            measurement: RwLock::new(Vec::new()),
            poll: BackgroundPoll::default(),
        }
    }

    /// Register a detector under its own name.
    pub fn with_detector(mut self, detector: Arc<dyn Readable>) -> Self {
        self.detectors.insert(detector.name().to_string(), detector);
        self
    }

    /// Install a settle-time callback.
    pub fn with_gate_settle(mut self, settle: GateSettle) -> Self {
        self.gate_settle = Some(settle);
        self
    }

    /// Replace the background completion poll.
    pub fn with_background_poll(mut self, poll: BackgroundPoll) -> Self {
        self.poll = poll;
        self
    }

    /// Build a simulated station from configuration.
    ///
    /// Every configured DAC becomes a [`VirtualIvvi`] and every detector a
    /// [`VirtualKeithley`] reading the configured device model. Without
    /// configured detectors a single `keithley1` is created.
    pub fn from_config(config: &TuningConfig) -> AppResult<Self> {
        config.validate().map_err(TuningError::Configuration)?;
        let station = &config.station;

        let instruments: Vec<Arc<dyn DacInstrument>> = station
            .instruments
            .iter()
            .map(|def| {
                Arc::new(VirtualIvvi::with_channels(def.name.clone(), def.channels))
                    as Arc<dyn DacInstrument>
            })
            .collect();
        let gates = Arc::new(VirtualDac::new("gates", instruments, station.gates.clone()));
        gates.set_boundaries(station.boundaries.iter().map(|(g, b)| (g.as_str(), *b)))?;

        let model = station
            .model
            .clone()
            .unwrap_or_else(|| DeviceModel::new(1.0));
        let names = if station.detectors.is_empty() {
            vec!["keithley1".to_string()]
        } else {
            station.detectors.clone()
        };

        let settle_table: BTreeMap<String, f64> = config.scan.gate_settle.clone();
        let default_settle = config.scan.default_settle;
        let settle: GateSettle = Arc::new(move |gate: &str| {
            settle_table.get(gate).copied().unwrap_or(default_settle)
        });

        let mut result = Self::new(gates.clone())
            .with_gate_settle(settle)
            .with_background_poll(BackgroundPoll {
                attempts: config.scan.background_poll_attempts,
                interval: config.scan.background_poll_interval(),
            });
        for name in &names {
            let detector = VirtualKeithley::new(name.clone(), gates.clone(), model.clone());
            result = result.with_detector(Arc::new(detector));
        }
        result.set_measurement(&names)?;

        info!(
            gates = result.gates.gates().len(),
            detectors = ?names,
            "Simulated station ready"
        );
        Ok(result)
    }

    /// Gate façade of the station.
    pub fn gates(&self) -> &Arc<VirtualDac> {
        &self.gates
    }

    /// Names of the registered detectors.
    pub fn detector_names(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    /// Look up a detector by name.
    pub fn detector(&self, name: &str) -> AppResult<Arc<dyn Readable>> {
        self.detectors
            .get(name)
            .cloned()
            .ok_or_else(|| TuningError::UnknownDetector(name.to_string()))
    }

    /// Resolve detector references.
    ///
    /// An empty selection falls back to the default measurement set with
    /// [`Station::set_measurement`].
    pub fn get_params(&self, refs: &[MeasurementRef]) -> AppResult<Vec<Arc<dyn Readable>>> {
        let names: Vec<String> = if refs.is_empty() {
            self.measurement.read().clone()
        } else {
            refs.iter().map(MeasurementRef::detector_name).collect()
        };
        if names.is_empty() {
            return Err(TuningError::InvalidScanJob(
                "no detectors selected".to_string(),
            ));
        }
        names.iter().map(|name| self.detector(name)).collect()
    }

    /// Set the default measured detectors.
    pub fn set_measurement(&self, names: &[String]) -> AppResult<()> {
        for name in names {
            self.detector(name)?;
        }
        debug!(detectors = ?names, "Default measurement updated");
        *self.measurement.write() = names.to_vec();
        Ok(())
    }

    /// Default measured detectors.
    pub fn measurement(&self) -> Vec<String> {
        self.measurement.read().clone()
    }

    /// Settle callback, if any.
    pub fn settle_callback(&self) -> Option<&GateSettle> {
        self.gate_settle.as_ref()
    }

    /// Settle time of `gate` from the station callback.
    pub fn gate_settle(&self, gate: &str) -> Option<f64> {
        self.gate_settle.as_ref().map(|settle| settle(gate))
    }

    /// Background job handle.
    pub fn background(&self) -> &BackgroundJobs {
        &self.background
    }

    /// Background completion poll.
    pub fn background_poll(&self) -> BackgroundPoll {
        self.poll
    }

    /// Run engine over all station detectors.
    pub fn engine(&self) -> Arc<RunEngine> {
        Arc::new(RunEngine::new(
            self.gates.clone(),
            self.detectors.values().cloned().collect(),
        ))
    }
}
