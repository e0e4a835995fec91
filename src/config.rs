//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/qdot_tuning.toml` (base configuration)
//! 2. Environment variables prefixed with `QDOT_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use qdot_tuning::config::TuningConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // QDOT_APPLICATION__LOG_LEVEL=debug overrides application.log_level
//! let config = TuningConfig::load()?;
//! config.validate()?;
//! println!("Output directory: {}", config.storage.output_dir.display());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::gates::{GateMap, InstrumentKey};
use crate::instrument::virtual_ivvi::DEFAULT_CHANNELS;
use crate::instrument::DeviceModel;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/qdot_tuning.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where datasets are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scan timing defaults
    #[serde(default)]
    pub scan: ScanConfig,
    /// Simulated station layout
    #[serde(default)]
    pub station: StationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for datasets
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Scan timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Per-point delay of 1D scans in seconds
    #[serde(default = "default_delay")]
    pub default_delay: f64,
    /// Settle time for gates without an entry in `gate_settle`
    #[serde(default = "default_settle")]
    pub default_settle: f64,
    /// Per-gate settle times in seconds
    #[serde(default)]
    pub gate_settle: BTreeMap<String, f64>,
    /// How often to poll an unfinished background measurement
    #[serde(default = "default_poll_attempts")]
    pub background_poll_attempts: u32,
    /// Interval between polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub background_poll_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            default_delay: default_delay(),
            default_settle: default_settle(),
            gate_settle: BTreeMap::new(),
            background_poll_attempts: default_poll_attempts(),
            background_poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ScanConfig {
    /// Poll interval as a [`Duration`]
    pub fn background_poll_interval(&self) -> Duration {
        Duration::from_millis(self.background_poll_interval_ms)
    }
}

/// DAC rack definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacDefinition {
    /// Unique instrument name
    pub name: String,
    /// Number of channels
    #[serde(default = "default_channels")]
    pub channels: u32,
}

/// Station layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    /// DAC racks, in index order
    #[serde(default)]
    pub instruments: Vec<DacDefinition>,
    /// Gate name to `[instrument, channel]`
    #[serde(default)]
    pub gates: GateMap,
    /// Initial gate boundaries as `[low, high]`
    #[serde(default)]
    pub boundaries: BTreeMap<String, (f64, f64)>,
    /// Detector names, e.g. `keithley1`
    #[serde(default)]
    pub detectors: Vec<String>,
    /// Simulated device read by the detectors
    #[serde(default)]
    pub model: Option<DeviceModel>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_delay() -> f64 {
    0.01
}

fn default_settle() -> f64 {
    0.001
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval() -> u64 {
    50
}

fn default_channels() -> u32 {
    DEFAULT_CHANNELS
}

impl TuningConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `QDOT_`.
    /// Example: `QDOT_STORAGE__OUTPUT_DIR=/tmp/run1`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("QDOT_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        // Validate timing
        if self.scan.background_poll_attempts == 0 || self.scan.background_poll_interval_ms == 0 {
            return Err("Background poll attempts and interval must be positive".to_string());
        }
        let mut delays = vec![("default_delay", self.scan.default_delay)];
        delays.push(("default_settle", self.scan.default_settle));
        delays.extend(self.scan.gate_settle.iter().map(|(g, v)| (g.as_str(), *v)));
        for (name, value) in delays {
            if !(value.is_finite() && value >= 0.0) {
                return Err(format!("Invalid delay {value} for {name}"));
            }
        }

        // Validate instrument names are unique
        let mut names = HashSet::new();
        for instrument in &self.station.instruments {
            if !names.insert(instrument.name.as_str()) {
                return Err(format!("Duplicate instrument name: {}", instrument.name));
            }
        }

        // Validate gate map references
        for (gate, channel_ref) in &self.station.gates {
            let instrument = match &channel_ref.instrument {
                InstrumentKey::Index(idx) => self.station.instruments.get(*idx),
                InstrumentKey::Name(name) => {
                    self.station.instruments.iter().find(|i| &i.name == name)
                }
            }
            .ok_or_else(|| {
                format!(
                    "Gate {gate} refers to undeclared instrument {}",
                    channel_ref.instrument
                )
            })?;
            if channel_ref.channel == 0 || channel_ref.channel > instrument.channels {
                return Err(format!(
                    "Gate {gate} refers to channel {} of {}, which has {} channels",
                    channel_ref.channel, instrument.name, instrument.channels
                ));
            }
        }

        // Validate detector names are unique
        let mut detectors = HashSet::new();
        for detector in &self.station.detectors {
            if !detectors.insert(detector.as_str()) {
                return Err(format!("Duplicate detector name: {detector}"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::ChannelRef;
    use figment::Jail;

    fn config() -> TuningConfig {
        let mut gates = GateMap::new();
        gates.insert("L".into(), ChannelRef::index(0, 1));
        gates.insert("R".into(), ChannelRef::named("ivvi", 2));
        TuningConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
            },
            storage: StorageConfig::default(),
            scan: ScanConfig::default(),
            station: StationConfig {
                instruments: vec![DacDefinition {
                    name: "ivvi".to_string(),
                    channels: 16,
                }],
                gates,
                detectors: vec!["keithley1".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = config();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gate_on_missing_instrument() {
        let mut config = config();
        config
            .station
            .gates
            .insert("P1".into(), ChannelRef::index(3, 1));
        let err = config.validate().unwrap_err();
        assert!(err.contains("undeclared instrument"));
    }

    #[test]
    fn test_gate_on_missing_channel() {
        let mut config = config();
        config
            .station
            .gates
            .insert("P1".into(), ChannelRef::named("ivvi", 17));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instrument_names() {
        let mut config = config();
        config.station.instruments.push(DacDefinition {
            name: "ivvi".to_string(),
            channels: 8,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "qdot.toml",
                r#"
                [application]
                name = "bench"

                [scan]
                background_poll_attempts = 4

                [station]
                detectors = ["keithley1"]

                [[station.instruments]]
                name = "ivvi"

                [station.gates]
                L = [0, 1]
                R = ["ivvi", 2]

                [station.boundaries]
                L = [-750.0, 0.0]
                "#,
            )?;
            jail.set_env("QDOT_APPLICATION__LOG_LEVEL", "debug");
            jail.set_env("QDOT_STORAGE__OUTPUT_DIR", "/tmp/qdot");

            let config = TuningConfig::load_from("qdot.toml")?;
            assert_eq!(config.application.name, "bench");
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.storage.output_dir, PathBuf::from("/tmp/qdot"));
            assert_eq!(config.scan.background_poll_attempts, 4);
            assert_eq!(config.scan.background_poll_interval_ms, 50);
            assert_eq!(config.station.instruments[0].channels, 16);
            assert_eq!(config.station.gates["R"], ChannelRef::named("ivvi", 2));
            assert_eq!(config.station.boundaries["L"], (-750.0, 0.0));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }
}
