//! # Quantum-Dot Tuning Library
//!
//! This crate drives the voltage gates of a quantum-dot measurement station,
//! runs 1D/2D gate sweeps, stores the measured traces as datasets and extracts
//! operating points (pinch-off voltages, one-dot balance points) from them.
//! The `qdot_tuning` binary runs the same routines against a simulated
//! station built from the configuration file.
//!
//! ## Crate Structure
//!
//! - **`boundary`**: `Boundary`, the `(low, high)` range a gate may take.
//! - **`gates`**: `VirtualDac`, the gate-mapping façade translating gate names to
//!   `(instrument, channel)` pairs, with boundary handling and scoped restore.
//! - **`instrument`**: the `DacInstrument` and `Readable` capability traits and
//!   the in-memory IVVI rack, Keithley and device model behind the simulated station.
//! - **`sweep`**: `SweepValues` and the range helpers used to build sweeps.
//! - **`scanjob`**: `ScanJob`, the plain description of a 1D/2D scan.
//! - **`plans`** / **`run_engine`**: sweep plans as command state machines, the
//!   engine executing them and the background measurement handle.
//! - **`station`**: `Station`, bundling gates, detectors and the background job.
//! - **`scans`**: `scan_1d`, `scan_2d`, pinch-off scans and the one-dot
//!   high-resolution scan.
//! - **`dataset`**: `DataSet` model, construction helpers and JSON persistence.
//! - **`analysis`**: pinch-off and balance-point extraction.
//! - **`metadata`**: `ScanMetadata` recorded with every scan.
//! - **`config`**: figment-based configuration (`TuningConfig`).
//! - **`tracing_setup`**: structured logging initialization.
//! - **`error`**: the crate error type `TuningError`.

pub mod analysis;
pub mod boundary;
pub mod config;
pub mod dataset;
pub mod error;
pub mod gates;
pub mod instrument;
pub mod metadata;
pub mod plans;
pub mod run_engine;
pub mod scanjob;
pub mod scans;
pub mod station;
pub mod sweep;
pub mod tracing_setup;

pub use error::{AppResult, TuningError};
