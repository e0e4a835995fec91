//! Integration tests for the scan runners and tuning routines
//!
//! Every test builds a simulated station: a virtual IVVI rack behind the gate
//! façade and a virtual Keithley reading a device model at the current gate
//! values. Settle times are zero so the scans run without sleeping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use qdot_tuning::analysis::OneDot;
use qdot_tuning::dataset::{dataset_2d_metadata, load_dataset};
use qdot_tuning::gates::{ChannelRef, GateMap, VirtualDac};
use qdot_tuning::instrument::model::DotFeature;
use qdot_tuning::instrument::{DacInstrument, DeviceModel, VirtualIvvi, VirtualKeithley};
use qdot_tuning::metadata::ScanMetadata;
use qdot_tuning::scanjob::{create_scan_job, MeasurementRef, ScanJob, SweepData};
use qdot_tuning::scans::{
    load_onedot_pinch_values, onedot_hires_scan, scan_1d, scan_2d, scan_pinch_value,
    wait_bg_finish, PinchOptions, ScanOptions,
};
use qdot_tuning::station::{BackgroundPoll, Station};
use qdot_tuning::TuningError;
use tempfile::TempDir;
use tracing_test::traced_test;

fn station(model: DeviceModel) -> Station {
    let ivvi: Arc<dyn DacInstrument> = Arc::new(VirtualIvvi::new("ivvi"));
    let mut map = GateMap::new();
    map.insert("L".into(), ChannelRef::index(0, 1));
    map.insert("P1".into(), ChannelRef::index(0, 2));
    map.insert("R".into(), ChannelRef::index(0, 3));
    let gates = Arc::new(VirtualDac::new("gates", vec![ivvi], map));

    let keithley = VirtualKeithley::new("keithley1", gates.clone(), model);
    let station = Station::new(gates)
        .with_detector(Arc::new(keithley))
        .with_gate_settle(Arc::new(|_: &str| 0.0));
    station
        .set_measurement(&["keithley1".to_string()])
        .unwrap();
    station
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= 1e-12 * y.abs().max(1.0), "{x} != {y}");
    }
}

fn pinching_model() -> DeviceModel {
    DeviceModel::new(1.0)
        .with_gate("L", -300.0, 15.0)
        .with_gate("P1", -200.0, 15.0)
        .with_gate("R", -400.0, 15.0)
}

// =============================================================================
// scan_1d / scan_2d
// =============================================================================

#[tokio::test]
async fn test_scan_1d_records_metadata() {
    let station = station(pinching_model());
    let job = ScanJob::sweep(SweepData::new("L", 0.0, -20.0, -4.0)).with_delay(0.0);

    let data = scan_1d(&station, &job, &ScanOptions::default()).await.unwrap();

    assert_eq!(data.array("L").unwrap().data, vec![0.0, -4.0, -8.0, -12.0, -16.0]);
    let measured = data.array("keithley1").unwrap();
    assert_eq!(measured.len(), 5);
    assert!(measured.data.iter().all(|v| (*v - 1.0).abs() < 1e-3));

    let meta = ScanMetadata::from_dataset(&data).unwrap().unwrap();
    assert_eq!(meta.scanjob, job);
    assert_eq!(meta.allgatevalues["L"], -16.0);
    assert!(meta.dt >= 0.0);
}

#[tokio::test]
async fn test_scan_1d_writes_location() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sweep.json");
    let station = station(pinching_model());
    let job = ScanJob::sweep(SweepData::new("R", -390.0, -410.0, 5.0)).with_delay(0.0);

    let options = ScanOptions::default()
        .with_location(&path)
        .with_title_comment("short sweep");
    let data = scan_1d(&station, &job, &options).await.unwrap();

    assert!(path.exists());
    let loaded = load_dataset(&path).unwrap();
    assert_eq!(loaded.array("R").unwrap().data, vec![-390.0, -395.0, -400.0, -405.0]);
    assert_close(
        &loaded.array("keithley1").unwrap().data,
        &data.array("keithley1").unwrap().data,
    );
    assert_eq!(loaded.metadata["comment"], "short sweep");

    let stored = ScanMetadata::from_dataset(&loaded).unwrap().unwrap();
    let original = ScanMetadata::from_dataset(&data).unwrap().unwrap();
    assert_eq!(stored.scanjob, original.scanjob);
    assert_eq!(stored.allgatevalues, original.allgatevalues);
    assert_eq!(stored.scantime, original.scantime);
}

#[tokio::test]
async fn test_scan_1d_background_records_negative_dt() {
    let station = station(pinching_model());
    let job = ScanJob::sweep(SweepData::new("L", 0.0, -10.0, -2.0)).with_delay(0.0);

    let options = ScanOptions::default().with_background(true);
    let data = scan_1d(&station, &job, &options).await.unwrap();

    assert_eq!(data.array("keithley1").unwrap().len(), 5);
    let meta = ScanMetadata::from_dataset(&data).unwrap().unwrap();
    assert_eq!(meta.dt, -1.0);
    assert!(!station.background().is_running());
    assert!(wait_bg_finish(&station).await);
}

#[traced_test]
#[tokio::test]
async fn test_scan_1d_background_outlasting_poll_still_collects() {
    let station = station(pinching_model()).with_background_poll(BackgroundPoll {
        attempts: 1,
        interval: Duration::from_millis(1),
    });
    let job = ScanJob::sweep(SweepData::new("L", 0.0, -10.0, -2.0)).with_delay(0.02);

    let options = ScanOptions::default().with_background(true);
    let data = scan_1d(&station, &job, &options).await.unwrap();

    assert_eq!(data.array("keithley1").unwrap().len(), 5);
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("background job not finished"))
            .count()
        {
            1 => Ok(()),
            n => Err(format!("expected one give-up message, got {n}")),
        }
    });
    assert!(!logs_contain("background measurement not completed"));
}

#[tokio::test]
async fn test_scan_1d_unknown_detector() {
    let station = station(pinching_model());
    let job = ScanJob::sweep(SweepData::new("L", 0.0, -10.0, -2.0))
        .with_instrument(vec![MeasurementRef::Name("lockin".into())]);

    let err = scan_1d(&station, &job, &ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TuningError::UnknownDetector(name) if name == "lockin"));
}

#[tokio::test]
async fn test_scan_1d_unknown_gate() {
    let station = station(pinching_model());
    let job = ScanJob::sweep(SweepData::new("P9", 0.0, -10.0, -2.0));

    let err = scan_1d(&station, &job, &ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TuningError::UnknownGate { .. }));
}

#[tokio::test]
async fn test_scan_2d_shape() {
    let station = station(pinching_model());
    let job = create_scan_job("L", (0.0, -8.0), Some("R"), Some((0.0, -12.0)), Some(-4.0), None);

    let data = scan_2d(&station, &job, &ScanOptions::default()).await.unwrap();

    let measured = data.array("keithley1").unwrap();
    assert_eq!(measured.shape, vec![2, 3]);
    let meta = dataset_2d_metadata(&data, None).unwrap();
    assert_eq!(meta.step_gate, "L");
    assert_eq!(meta.sweep_gate, "R");
    assert_eq!(meta.vstep, vec![0.0, -4.0]);
    assert_eq!(meta.vsweep, vec![0.0, -4.0, -8.0]);

    let scan_meta = ScanMetadata::from_dataset(&data).unwrap().unwrap();
    assert_eq!(scan_meta.allgatevalues["L"], -4.0);
    assert_eq!(scan_meta.allgatevalues["R"], -8.0);
}

#[tokio::test]
async fn test_scan_2d_falls_back_to_wait_time() {
    let station = station(pinching_model());
    let job = create_scan_job("L", (0.0, -8.0), Some("R"), Some((0.0, -12.0)), Some(-4.0), None);
    let options = ScanOptions::default().with_wait_time(0.02);

    let data = scan_2d(&station, &job, &options).await.unwrap();

    // one wait per inner point of the 2 x 3 grid
    let scan_meta = ScanMetadata::from_dataset(&data).unwrap().unwrap();
    assert!(scan_meta.dt >= 0.12, "dt {}", scan_meta.dt);
}

// =============================================================================
// Pinch-off scans
// =============================================================================

#[tokio::test]
async fn test_scan_pinch_value_analyses_and_resets() {
    let dir = TempDir::new().unwrap();
    let station = station(pinching_model());
    station.gates().set("L", -20.0).unwrap();

    let data = scan_pinch_value(&station, dir.path(), "L", &PinchOptions::default())
        .await
        .unwrap();

    let sweep = data.array("L").unwrap();
    assert_eq!(sweep.data[0], 0.0);
    assert_eq!(sweep.data[1], -6.0);
    assert_eq!(sweep.len(), 125);

    let adata: serde_json::Value = data.metadata["adata"].clone();
    assert_eq!(adata["good_gate"], true);
    let pinch = adata["pinch_value"].as_f64().unwrap();
    assert!((pinch - (-333.0)).abs() < 8.0, "pinch value {pinch}");

    assert_eq!(station.gates().get("L").unwrap(), -20.0);
    assert!(dir.path().join("one_dot/pinchoff-sweep-1d-L.json").exists());
}

#[tokio::test]
async fn test_scan_pinch_value_resets_to_base() {
    let dir = TempDir::new().unwrap();
    let station = station(pinching_model());
    let options = PinchOptions {
        basevalues: Some(BTreeMap::from([("R".to_string(), -50.0)])),
        full: true,
        ..Default::default()
    };

    let data = scan_pinch_value(&station, dir.path(), "R", &options)
        .await
        .unwrap();

    // sweep starts at max(base, 0)
    assert_eq!(data.array("R").unwrap().data[0], 0.0);
    assert_eq!(data.array("R").unwrap().data[1], -2.0);
    assert_eq!(station.gates().get("R").unwrap(), -50.0);
}

#[traced_test]
#[tokio::test]
async fn test_scan_pinch_value_keeps_scan_error_when_reset_fails() {
    let dir = TempDir::new().unwrap();
    let station = station(pinching_model());
    station.gates().set_boundaries([("L", (-800.0, 0.0))]).unwrap();
    // base below the boundary: the sweep from 0 fits but the reset does not
    let options = PinchOptions {
        basevalues: Some(BTreeMap::from([("L".to_string(), -900.0)])),
        instrument: vec![MeasurementRef::Name("keithley9".into())],
        ..Default::default()
    };

    let err = scan_pinch_value(&station, dir.path(), "L", &options)
        .await
        .unwrap_err();

    assert!(matches!(err, TuningError::UnknownDetector(_)), "{err}");
    assert!(logs_contain("Failed to reset gate after pinch-off scan"));
    assert_eq!(station.gates().get("L").unwrap(), 0.0);
}

#[tokio::test]
async fn test_scan_pinch_value_uses_cache() {
    let dir = TempDir::new().unwrap();
    let station = station(pinching_model());
    let first = scan_pinch_value(&station, dir.path(), "L", &PinchOptions::default())
        .await
        .unwrap();

    // a different device proves the second result comes from disk
    let other = station_with_flat_device();
    let options = PinchOptions {
        cache: true,
        ..Default::default()
    };
    let cached = scan_pinch_value(&other, dir.path(), "L", &options)
        .await
        .unwrap();

    assert_eq!(cached.metadata["adata"]["good_gate"], true);
    assert_close(
        &[cached.metadata["adata"]["pinch_value"].as_f64().unwrap()],
        &[first.metadata["adata"]["pinch_value"].as_f64().unwrap()],
    );
    assert_close(
        &cached.array("keithley1").unwrap().data,
        &first.array("keithley1").unwrap().data,
    );
}

fn station_with_flat_device() -> Station {
    station(DeviceModel::new(1.0))
}

#[tokio::test]
async fn test_load_onedot_pinch_values() {
    let dir = TempDir::new().unwrap();
    let station = station(pinching_model());
    let mut expected = Vec::new();
    for gate in ["L", "P1", "R"] {
        let data = scan_pinch_value(&station, dir.path(), gate, &PinchOptions::default())
            .await
            .unwrap();
        expected.push(data.metadata["adata"]["pinch_value"].as_f64().unwrap());
    }

    let mut od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1));
    let values = load_onedot_pinch_values(&mut od, dir.path()).unwrap();

    assert_close(&values, &expected);
    assert_eq!(od.pinchvalues, Some(values));
    assert!(values[1] > values[0] && values[0] > values[2]);
}

#[tokio::test]
async fn test_load_onedot_pinch_values_missing_file() {
    let dir = TempDir::new().unwrap();
    let mut od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1));

    let err = load_onedot_pinch_values(&mut od, dir.path()).unwrap_err();
    assert!(matches!(err, TuningError::DatasetNotFound(_)));
    assert!(err.to_string().starts_with("could not load file"));
    assert!(od.pinchvalues.is_none());
}

// =============================================================================
// One-dot high-resolution scan
// =============================================================================

#[tokio::test]
async fn test_onedot_hires_scan_finds_dot() {
    let model = DeviceModel::new(0.0).with_dot(DotFeature {
        gate_x: "R".into(),
        gate_y: "L".into(),
        center_x: -200.0,
        center_y: -250.0,
        width: 8.0,
        amplitude: 1.0,
    });
    let station = station(model);
    let od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1))
        .with_balancepoint([-196.0, -246.0]);

    let result = onedot_hires_scan(&station, od, 20.0, None).await.unwrap();

    let step = result.scanjob.stepdata.as_ref().unwrap();
    assert_eq!((step.start, step.end, step.step), (-222.0, -270.0, -4.0));
    let sweep = result.scanjob.sweepdata.as_ref().unwrap();
    assert_eq!((sweep.start, sweep.end), (-172.0, -220.0));

    let fine = result.od.balancepointfine.unwrap();
    assert!((fine[0] - (-200.0)).abs() < 0.5, "{fine:?}");
    assert!((fine[1] - (-250.0)).abs() < 0.5, "{fine:?}");
    let setpoint = result.od.setpoint.unwrap();
    assert_eq!(setpoint, [fine[0] + 10.0, fine[1] + 10.0]);

    let direction = result.od.coulombdirection.unwrap();
    assert!((direction[0].hypot(direction[1]) - 1.0).abs() < 1e-9);

    let stored: OneDot = result.dataset.metadata_as("od").unwrap().unwrap();
    assert_eq!(stored, result.od);
}

#[tokio::test]
async fn test_onedot_hires_scan_keeps_balance_point_on_flat_data() {
    let station = station(DeviceModel::new(1.0));
    let od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1))
        .with_balancepoint([-770.0, -770.0]);

    let result = onedot_hires_scan(&station, od, 20.0, None).await.unwrap();

    // both axes are clipped at the lowest allowed voltage
    assert_eq!(result.scanjob.stepdata.as_ref().unwrap().end, -780.0);
    assert_eq!(result.scanjob.sweepdata.as_ref().unwrap().end, -780.0);

    assert_eq!(result.od.balancepointfine, Some([-770.0, -770.0]));
    assert_eq!(result.od.setpoint, Some([-760.0, -760.0]));
    assert_eq!(result.od.coulombdirection, Some([1.0, 0.0]));
}

#[tokio::test]
async fn test_onedot_hires_scan_needs_balance_point() {
    let station = station(DeviceModel::new(1.0));
    let od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1));

    let err = onedot_hires_scan(&station, od, 20.0, None).await.unwrap_err();
    assert!(matches!(err, TuningError::InvalidScanJob(_)));
}
