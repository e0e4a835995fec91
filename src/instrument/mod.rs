//! Backing instruments for gate control and readout.
//!
//! Two small capability traits describe what the tuning code needs from hardware:
//!
//! - [`DacInstrument`]: a rack of numbered voltage output channels. Gates are
//!   mapped onto `(instrument, channel)` pairs by the virtual DAC façade.
//! - [`Readable`]: a detector returning one scalar per read (current,
//!   conductance, ...).
//!
//! `DacInstrument` is synchronous: gate writes happen inside scoped restore guards
//! and `Drop` implementations, where no async context is available. Implementations
//! use interior mutability. `Readable` is async like the other acquisition
//! capabilities, since a read may block on an integration time.
//!
//! The in-memory implementations ([`VirtualIvvi`], [`VirtualKeithley`]) back the
//! simulated station used by tests and the CLI.

pub mod keithley;
pub mod model;
pub mod virtual_ivvi;

pub use keithley::VirtualKeithley;
pub use model::DeviceModel;
pub use virtual_ivvi::VirtualIvvi;

use anyhow::Result;
use async_trait::async_trait;

use crate::boundary::Boundary;
use crate::error::AppResult;

/// Capability: voltage output rack
///
/// # Contract
/// - Channel numbers are instrument-native (an IVVI rack counts from 1).
/// - `set_channel` rejects values outside the channel's valid range and leaves
///   the channel unchanged in that case.
/// - `set_channel_bounds(ch, None)` removes the channel restriction.
pub trait DacInstrument: Send + Sync {
    /// Unique instrument name
    fn name(&self) -> &str;

    /// Valid channel numbers
    fn channels(&self) -> Vec<u32>;

    /// Current output value of a channel
    fn get_channel(&self, channel: u32) -> AppResult<f64>;

    /// Set the output value of a channel
    fn set_channel(&self, channel: u32, value: f64) -> AppResult<()>;

    /// Valid range of a channel, if restricted
    fn channel_bounds(&self, channel: u32) -> AppResult<Option<Boundary>>;

    /// Replace the valid range of a channel
    fn set_channel_bounds(&self, channel: u32, bounds: Option<Boundary>) -> AppResult<()>;
}

/// Capability: Scalar Readout
///
/// Devices that produce one value per read (ammeters, lock-in magnitudes).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Detector name as used in datasets
    fn name(&self) -> &str;

    /// Read current value
    ///
    /// # Returns
    /// - Ok(value) on successful read
    /// - Err on hardware error or timeout
    async fn read(&self) -> Result<f64>;
}
