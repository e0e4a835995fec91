//! Custom error types for the tuning library.
//!
//! This module defines the primary error type, `TuningError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur, from configuration and file I/O
//! issues to gate-mapping and scan-job problems.
//!
//! ## Error Hierarchy
//!
//! - **Gate mapping**: `UnknownGate`, `UnknownInstrument`, `InvalidChannel`,
//!   `InvalidBoundary`, `OutOfBounds`. Raised by the virtual DAC façade; a missing
//!   mapping always propagates to the caller.
//! - **Scans**: `InvalidScanJob`, `UnknownDetector`, `Engine`, `Background`, `Instrument`.
//! - **Datasets**: `DatasetShape`, `MissingArray`, `DatasetNotFound`, `Io`, `Serialization`.
//! - **Analysis**: `Analysis` for traces that cannot be analysed.
//! - **Configuration**: `Config` wraps figment extraction errors, `Configuration`
//!   holds semantic validation failures.
//!
//! By using `#[from]`, `TuningError` can be created from the underlying error types,
//! so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TuningError>;

/// Primary error type for gate control, scans and analysis.
#[derive(Error, Debug)]
pub enum TuningError {
    /// Gate name is not present in the gate map.
    #[error("{dac} has no gate {gate}")]
    UnknownGate {
        /// Name of the virtual DAC that was queried
        dac: String,
        /// Gate that was requested
        gate: String,
    },

    /// Gate map refers to an instrument that is not registered.
    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    /// Instrument has no such channel.
    #[error("Instrument '{instrument}' has no channel {channel}")]
    InvalidChannel {
        /// Instrument name
        instrument: String,
        /// Requested channel number
        channel: u32,
    },

    /// Boundary pair with `low > high`, or an empty intersection.
    #[error("Invalid boundary for gate {gate}: ({low}, {high})")]
    InvalidBoundary {
        /// Gate the boundary was meant for
        gate: String,
        /// Lower bound
        low: f64,
        /// Upper bound
        high: f64,
    },

    /// A value was rejected because it lies outside the allowed range.
    #[error("Value {value} for {target} is outside the range ({low}, {high})")]
    OutOfBounds {
        /// Gate or channel the value was meant for
        target: String,
        /// Rejected value
        value: f64,
        /// Lower bound
        low: f64,
        /// Upper bound
        high: f64,
    },

    /// Scan job is missing data required by the scan.
    #[error("Invalid scan job: {0}")]
    InvalidScanJob(String),

    /// Detector lookup failed on the station.
    #[error("Station has no detector {0}")]
    UnknownDetector(String),

    /// Error reported by a backing instrument or detector.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Run engine refused or could not execute a plan.
    #[error("Run engine error: {0}")]
    Engine(String),

    /// Background measurement failed or was lost.
    #[error("Background measurement error: {0}")]
    Background(String),

    /// Inconsistent names or shapes while building a dataset.
    #[error("{0}")]
    DatasetShape(String),

    /// Dataset lacks the requested array.
    #[error("Dataset has no array {0}")]
    MissingArray(String),

    /// Stored dataset does not exist.
    #[error("could not load file {}", .0.display())]
    DatasetNotFound(std::path::PathBuf),

    /// Trace cannot be analysed.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// I/O error while reading or writing datasets.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration extraction error.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for TuningError {
    fn from(value: figment::Error) -> Self {
        TuningError::Config(Box::new(value))
    }
}

impl TuningError {
    /// Convenience constructor for [`TuningError::UnknownGate`].
    pub fn unknown_gate(dac: impl Into<String>, gate: impl Into<String>) -> Self {
        TuningError::UnknownGate {
            dac: dac.into(),
            gate: gate.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_gate_message_names_the_dac() {
        let err = TuningError::unknown_gate("gates", "P7");
        assert_eq!(err.to_string(), "gates has no gate P7");
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn open() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        assert!(matches!(open(), Err(TuningError::Io(_))));
    }
}
