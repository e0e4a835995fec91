//! Virtual ammeter reading a simulated device.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{DeviceModel, Readable};
use crate::gates::VirtualDac;

/// Virtual Keithley multimeter.
///
/// Each read evaluates the [`DeviceModel`] at the current gate voltages of the
/// attached [`VirtualDac`], so sweeping a gate changes what the detector reports.
pub struct VirtualKeithley {
    name: String,
    gates: Arc<VirtualDac>,
    model: DeviceModel,
}

impl VirtualKeithley {
    /// Create a detector reading `model` through `gates`.
    pub fn new(name: impl Into<String>, gates: Arc<VirtualDac>, model: DeviceModel) -> Self {
        Self {
            name: name.into(),
            gates,
            model,
        }
    }

    /// The simulated device.
    pub fn model(&self) -> &DeviceModel {
        &self.model
    }
}

#[async_trait]
impl Readable for VirtualKeithley {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<f64> {
        let values = self.gates.all_values()?;
        Ok(self.model.sample(&values))
    }
}
