//! In-memory IVVI-style DAC rack.

use parking_lot::RwLock;
use tracing::debug;

use super::DacInstrument;
use crate::boundary::Boundary;
use crate::error::{AppResult, TuningError};

/// Default number of DAC channels on a virtual IVVI rack.
pub const DEFAULT_CHANNELS: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct DacChannel {
    value: f64,
    bounds: Option<Boundary>,
}

/// Virtual IVVI rack with channels `dac1..=dacN`.
///
/// All channels start at 0 mV without restrictions. Values are held in memory,
/// so reads return exactly what was last written.
///
/// # Example
///
/// ```rust
/// use qdot_tuning::instrument::{DacInstrument, VirtualIvvi};
///
/// let ivvi = VirtualIvvi::new("ivvi");
/// ivvi.set_channel(3, -120.0).unwrap();
/// assert_eq!(ivvi.get_channel(3).unwrap(), -120.0);
/// ```
#[derive(Debug)]
pub struct VirtualIvvi {
    name: String,
    channels: RwLock<Vec<DacChannel>>,
}

impl VirtualIvvi {
    /// Create a rack with [`DEFAULT_CHANNELS`] channels.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_channels(name, DEFAULT_CHANNELS)
    }

    /// Create a rack with `count` channels.
    pub fn with_channels(name: impl Into<String>, count: u32) -> Self {
        let channels = (0..count)
            .map(|_| DacChannel {
                value: 0.0,
                bounds: None,
            })
            .collect();
        Self {
            name: name.into(),
            channels: RwLock::new(channels),
        }
    }

    fn index(&self, channel: u32, len: usize) -> AppResult<usize> {
        let idx = channel as usize;
        if channel == 0 || idx > len {
            return Err(TuningError::InvalidChannel {
                instrument: self.name.clone(),
                channel,
            });
        }
        Ok(idx - 1)
    }

    fn channel_label(&self, channel: u32) -> String {
        format!("{}.dac{}", self.name, channel)
    }
}

impl DacInstrument for VirtualIvvi {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<u32> {
        (1..=self.channels.read().len() as u32).collect()
    }

    fn get_channel(&self, channel: u32) -> AppResult<f64> {
        let channels = self.channels.read();
        let idx = self.index(channel, channels.len())?;
        Ok(channels[idx].value)
    }

    fn set_channel(&self, channel: u32, value: f64) -> AppResult<()> {
        let mut channels = self.channels.write();
        let idx = self.index(channel, channels.len())?;
        if let Some(bounds) = channels[idx].bounds {
            bounds.check(&self.channel_label(channel), value)?;
        }
        debug!(instrument = %self.name, channel, value, "Setting DAC channel");
        channels[idx].value = value;
        Ok(())
    }

    fn channel_bounds(&self, channel: u32) -> AppResult<Option<Boundary>> {
        let channels = self.channels.read();
        let idx = self.index(channel, channels.len())?;
        Ok(channels[idx].bounds)
    }

    fn set_channel_bounds(&self, channel: u32, bounds: Option<Boundary>) -> AppResult<()> {
        let mut channels = self.channels.write();
        let idx = self.index(channel, channels.len())?;
        channels[idx].bounds = bounds;
        Ok(())
    }
}
