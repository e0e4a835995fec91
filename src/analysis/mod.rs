//! Operating-point extraction from scanned data.
//!
//! - [`gatesweep`]: pinch-off voltage of a single gate from a 1D sweep.
//! - [`onedot`]: the [`OneDot`] description, its fine balance point and the
//!   direction of the Coulomb lines in a 2D scan.

pub mod gatesweep;
pub mod onedot;

pub use gatesweep::{analyse_gate_sweep, GateSweepAnalysis};
pub use onedot::{find_coulomb_direction, onedot_balance_fine, FineBalance, OneDot};
