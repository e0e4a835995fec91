//! Tests for loading the shipped configuration and building a station from it.

use std::path::PathBuf;

use qdot_tuning::config::{DacDefinition, TuningConfig};
use qdot_tuning::gates::ChannelRef;
use qdot_tuning::instrument::DacInstrument;
use qdot_tuning::station::Station;
use qdot_tuning::TuningError;

fn sample_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/qdot_tuning.toml")
}

fn sample_config() -> TuningConfig {
    TuningConfig::load_from(sample_config_path()).unwrap()
}

#[test]
fn test_sample_config_is_valid() {
    let config = sample_config();
    assert!(config.validate().is_ok());

    assert_eq!(config.station.instruments.len(), 2);
    assert_eq!(config.station.gates["SD1a"], ChannelRef::named("ivvi2", 1));
    assert_eq!(config.station.gates["P1"], ChannelRef::index(0, 2));
    assert_eq!(config.scan.gate_settle["P1"], 0.005);
    assert!(config.station.model.is_some());
}

#[test]
fn test_station_from_sample_config() {
    let config = sample_config();
    let station = Station::from_config(&config).unwrap();

    assert_eq!(station.detector_names(), vec!["keithley1", "keithley3"]);
    assert_eq!(station.measurement(), vec!["keithley1", "keithley3"]);
    assert_eq!(
        station.gates().gates(),
        vec!["L", "P1", "R", "SD1a", "SD1b"]
    );

    let boundary = station.gates().boundary("L").unwrap();
    assert_eq!((boundary.low(), boundary.high()), (-780.0, 100.0));
    assert!(station.gates().boundary("SD1a").is_none());

    assert_eq!(station.gate_settle("P1"), Some(0.005));
    assert_eq!(station.gate_settle("L"), Some(0.001));
}

#[test]
fn test_station_gates_write_through_to_racks() {
    let station = Station::from_config(&sample_config()).unwrap();

    station.gates().set("SD1b", -42.0).unwrap();
    let rack = station
        .gates()
        .instruments()
        .into_iter()
        .find(|i| i.name() == "ivvi2")
        .unwrap();
    assert_eq!(rack.get_channel(2).unwrap(), -42.0);

    assert!(matches!(
        station.gates().set("L", 200.0),
        Err(TuningError::OutOfBounds { .. })
    ));
}

#[test]
fn test_station_rejects_unknown_rack() {
    let mut config = sample_config();
    config
        .station
        .gates
        .insert("B1".into(), ChannelRef::named("ivvi9", 1));

    let err = Station::from_config(&config).unwrap_err();
    match err {
        TuningError::Configuration(msg) => assert!(msg.contains("ivvi9"), "{msg}"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_station_rejects_channel_out_of_range() {
    let mut config = sample_config();
    config.station.instruments[1] = DacDefinition {
        name: "ivvi2".into(),
        channels: 1,
    };

    let err = Station::from_config(&config).unwrap_err();
    assert!(err.to_string().contains("which has 1 channels"));
}

#[test]
fn test_default_detector_when_none_configured() {
    let mut config = sample_config();
    config.station.detectors.clear();

    let station = Station::from_config(&config).unwrap();
    assert_eq!(station.detector_names(), vec!["keithley1"]);
}
