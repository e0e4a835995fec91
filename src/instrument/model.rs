//! Simulated quantum-dot device.
//!
//! The model gives the virtual detectors something physical-looking to measure:
//! every gate with a pinch-off entry closes the channel through a logistic step,
//! and an optional Gaussian feature over two gates stands in for a tuned dot.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Pinch-off characteristics of one gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinchGate {
    /// Voltage at the middle of the closing step (mV)
    pub pinch: f64,
    /// Width of the step (mV)
    pub width: f64,
}

/// Gaussian conductance feature spanned by two gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DotFeature {
    /// Horizontal gate
    pub gate_x: String,
    /// Vertical gate
    pub gate_y: String,
    /// Centre voltage of `gate_x`
    pub center_x: f64,
    /// Centre voltage of `gate_y`
    pub center_y: f64,
    /// Standard deviation (mV)
    pub width: f64,
    /// Peak height added to the channel current
    pub amplitude: f64,
}

/// Simulated device returning a current for a set of gate voltages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    /// Open-channel current
    pub amplitude: f64,
    /// Gates that pinch off the channel
    #[serde(default)]
    pub gates: BTreeMap<String, PinchGate>,
    /// Optional dot feature
    #[serde(default)]
    pub dot: Option<DotFeature>,
    /// Peak amplitude of uniform noise (0 disables noise)
    #[serde(default)]
    pub noise: f64,
}

impl DeviceModel {
    /// Model with the given open-channel current and no gates.
    pub fn new(amplitude: f64) -> Self {
        Self {
            amplitude,
            ..Default::default()
        }
    }

    /// Add a pinch-off gate.
    pub fn with_gate(mut self, gate: impl Into<String>, pinch: f64, width: f64) -> Self {
        self.gates.insert(gate.into(), PinchGate { pinch, width });
        self
    }

    /// Add a dot feature.
    pub fn with_dot(mut self, dot: DotFeature) -> Self {
        self.dot = Some(dot);
        self
    }

    /// Set the noise amplitude.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Noise-free current for the given gate voltages.
    ///
    /// Gates missing from `values` are treated as fully open.
    pub fn current(&self, values: &BTreeMap<String, f64>) -> f64 {
        let channel: f64 = self
            .gates
            .iter()
            .map(|(name, g)| match values.get(name) {
                Some(v) => logistic((v - g.pinch) / g.width.max(f64::EPSILON)),
                None => 1.0,
            })
            .product();

        let dot = self.dot.as_ref().map_or(0.0, |d| {
            let x = values.get(&d.gate_x).copied().unwrap_or(d.center_x);
            let y = values.get(&d.gate_y).copied().unwrap_or(d.center_y);
            let r2 = (x - d.center_x).powi(2) + (y - d.center_y).powi(2);
            d.amplitude * (-r2 / (2.0 * d.width * d.width)).exp()
        });

        self.amplitude * channel + dot
    }

    /// Current including noise.
    pub fn sample(&self, values: &BTreeMap<String, f64>) -> f64 {
        let current = self.current(values);
        if self.noise > 0.0 {
            current + rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            current
        }
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
