//! Scan runners and tuning routines built on them.
//!
//! The runners resolve gate names on the [`Station`], turn a [`ScanJob`] into a
//! [`LineScan`] or [`GridScan`], execute it in the foreground or as the
//! station's background measurement, and attach [`ScanMetadata`] to the
//! resulting dataset.
//!
//! # Example
//!
//! ```no_run
//! use qdot_tuning::scanjob::{ScanJob, SweepData};
//! use qdot_tuning::scans::{scan_1d, ScanOptions};
//! use qdot_tuning::station::Station;
//!
//! # async fn example(station: &Station) -> qdot_tuning::error::AppResult<()> {
//! let job = ScanJob::sweep(SweepData::new("L", 0.0, -300.0, -4.0));
//! let data = scan_1d(station, &job, &ScanOptions::default()).await?;
//! println!("measured {}", data.default_parameter()?.name);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local};
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::analysis::{analyse_gate_sweep, find_coulomb_direction, onedot_balance_fine, OneDot};
use crate::config::ScanConfig;
use crate::dataset::{
    add_comment, dataset_to_image, load_dataset, make_dataset_1d_plain, make_dataset_2d_plain,
    write_dataset, DataSet, MEASURED,
};
use crate::error::{AppResult, TuningError};
use crate::gates::VirtualDac;
use crate::metadata::ScanMetadata;
use crate::plans::{GridScan, LineScan, Plan};
use crate::scanjob::{create_scan_job, MeasurementRef, ScanJob, SweepData};
use crate::station::{GateSettle, Station};
use crate::sweep::linspace;

/// Settle time used when neither a callback nor a station provides one.
pub const DEFAULT_WAIT_TIME: f64 = 0.001;

/// Lowest gate voltage a one-dot high-resolution scan may reach (mV).
const HIRES_LIMIT: f64 = -780.0;
/// Step of the one-dot high-resolution scan (mV).
const HIRES_STEP: f64 = -4.0;
/// Below this accuracy the coarse balance point is kept.
const HIRES_MIN_ACCURACY: f64 = 0.2;
/// Window for the Coulomb direction (mV).
const COULOMB_WIDTH_MV: f64 = 8.0;
/// Offset of the one-dot setpoint from its fine balance point (mV).
const SETPOINT_OFFSET: f64 = 10.0;

/// End of every pinch-off sweep (mV).
const PINCH_END: f64 = -750.0;

/// Settle time for `gate`.
///
/// An explicit `gate_settle` callback wins over the station's callback; the
/// fallback is [`DEFAULT_WAIT_TIME`].
pub fn wait_time(gate: &str, station: Option<&Station>, gate_settle: Option<&GateSettle>) -> f64 {
    if let Some(settle) = gate_settle {
        return settle(gate);
    }
    station
        .and_then(|station| station.gate_settle(gate))
        .unwrap_or(DEFAULT_WAIT_TIME)
}

/// Options shared by [`scan_1d`] and [`scan_2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Where to write the dataset
    pub location: Option<PathBuf>,
    /// Per-point delay of 1D scans in seconds
    pub delay: f64,
    /// Run as the station's background measurement
    pub background: bool,
    /// Settle time overriding `delay`
    pub wait_time: Option<f64>,
    /// Comment stored with the dataset
    pub title_comment: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            location: None,
            delay: 0.01,
            background: false,
            wait_time: None,
            title_comment: None,
        }
    }
}

impl ScanOptions {
    /// Defaults taken from the scan configuration.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            delay: config.default_delay,
            ..Default::default()
        }
    }

    /// Write the dataset to `location`.
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the per-point delay.
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Run in the background.
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Set the settle time.
    pub fn with_wait_time(mut self, wait_time: f64) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    /// Set the dataset comment.
    pub fn with_title_comment(mut self, comment: impl Into<String>) -> Self {
        self.title_comment = Some(comment.into());
        self
    }
}

async fn run_plan(
    station: &Station,
    plan: Box<dyn Plan>,
    background: bool,
) -> AppResult<DataSet> {
    if background {
        station.background().spawn(station.engine(), plan)?;
        wait_bg_finish(station).await;
        station.background().join().await
    } else {
        station.engine().run(plan).await
    }
}

fn finish_dataset(
    station: &Station,
    mut dataset: DataSet,
    scanjob: &ScanJob,
    options: &ScanOptions,
    scantime: DateTime<Local>,
    dt: f64,
) -> AppResult<DataSet> {
    if let Some(comment) = &options.title_comment {
        add_comment(&mut dataset, comment);
    }
    ScanMetadata::new(station.gates().all_values()?, scantime, scanjob.clone())
        .with_dt(dt)
        .attach(&mut dataset)?;

    if let Some(location) = &options.location {
        dataset.location = Some(location.display().to_string());
        write_dataset(location, &dataset)?;
    }
    Ok(dataset)
}

fn selected_detectors(station: &Station, scanjob: &ScanJob) -> AppResult<Vec<String>> {
    let params = station.get_params(&scanjob.instrument)?;
    let names: Vec<String> = params.iter().map(|p| p.name().to_string()).collect();
    station.set_measurement(&names)?;
    Ok(names)
}

/// Sweep one gate and record the selected detectors.
///
/// The per-point delay is the scan job's delay, else `options.wait_time`,
/// else `options.delay`. A background scan is polled with
/// [`wait_bg_finish`] and records `dt = -1`.
pub async fn scan_1d(
    station: &Station,
    scanjob: &ScanJob,
    options: &ScanOptions,
) -> AppResult<DataSet> {
    let sweepdata = scanjob.require_sweepdata()?;
    let gate = sweepdata.primary_gate()?;
    let sweepvalues = station
        .gates()
        .parameter(gate)?
        .sweep(sweepdata.start, sweepdata.end, sweepdata.step)?;

    let delay = scanjob
        .delay
        .unwrap_or_else(|| options.wait_time.unwrap_or(options.delay));
    let detectors = selected_detectors(station, scanjob)?;
    debug!(gate = %gate, points = sweepvalues.len(), delay, "scan1D: starting loop");

    let plan = LineScan::new(sweepvalues)
        .with_detectors(&detectors)
        .with_delay(delay);

    let scantime = Local::now();
    let started = Instant::now();
    let dataset = run_plan(station, Box::new(plan), options.background).await?;
    let dt = if options.background {
        -1.0
    } else {
        started.elapsed().as_secs_f64()
    };

    let dataset = finish_dataset(station, dataset, scanjob, options, scantime, dt)?;
    info!(gate = %gate, location = ?dataset.location, dt, "scan1D: done");
    Ok(dataset)
}

/// Step one gate and sweep another, recording the selected detectors.
///
/// The delay after every move is the scan job's delay, else
/// `options.wait_time`, else zero.
pub async fn scan_2d(
    station: &Station,
    scanjob: &ScanJob,
    options: &ScanOptions,
) -> AppResult<DataSet> {
    let stepdata = scanjob.require_stepdata()?;
    let sweepdata = scanjob.require_sweepdata()?;
    let stepgate = stepdata.primary_gate()?;
    let sweepgate = sweepdata.primary_gate()?;

    let stepvalues = station
        .gates()
        .parameter(stepgate)?
        .sweep(stepdata.start, stepdata.end, stepdata.step)?;
    let sweepvalues = station
        .gates()
        .parameter(sweepgate)?
        .sweep(sweepdata.start, sweepdata.end, sweepdata.step)?;

    let delay = scanjob.delay.or(options.wait_time).unwrap_or(0.0);
    let detectors = selected_detectors(station, scanjob)?;
    info!(
        step_gate = %stepgate,
        sweep_gate = %sweepgate,
        steps = stepvalues.len(),
        sweeps = sweepvalues.len(),
        delay,
        "scan2D: starting loop"
    );

    let plan = GridScan::new(stepvalues, sweepvalues)
        .with_detectors(&detectors)
        .with_delay(delay);

    let scantime = Local::now();
    let started = Instant::now();
    let dataset = run_plan(station, Box::new(plan), options.background).await?;
    let dt = started.elapsed().as_secs_f64();

    let dataset = finish_dataset(station, dataset, scanjob, options, scantime, dt)?;
    info!(location = ?dataset.location, dt, "scan2D: done");
    Ok(dataset)
}

/// Poll the station's background measurement until it finishes.
///
/// Uses the station's [`BackgroundPoll`](crate::station::BackgroundPoll)
/// (10 polls, 50 ms apart by default) and returns whether no measurement is
/// running afterwards.
pub async fn wait_bg_finish(station: &Station) -> bool {
    let poll = station.background_poll();
    station
        .background()
        .wait_finished(poll.attempts, poll.interval)
        .await
}

/// Base file name of a pinch-off scan.
pub fn pinchoff_filename(gate: &str, od: Option<&OneDot>) -> String {
    match od {
        None => format!("pinchoff-sweep-1d-{gate}"),
        Some(od) => format!("{}-sweep-1d-{gate}", od.name),
    }
}

fn pinchoff_path(outputdir: &Path, gate: &str) -> PathBuf {
    outputdir
        .join("one_dot")
        .join(format!("{}.json", pinchoff_filename(gate, None)))
}

/// Options of [`scan_pinch_value`].
#[derive(Debug, Clone, PartialEq)]
pub struct PinchOptions {
    /// Base gate values; the sweep starts at `max(base, 0)`
    pub basevalues: Option<BTreeMap<String, f64>>,
    /// Detectors to record
    pub instrument: Vec<MeasurementRef>,
    /// Per-point delay, defaults to the gate's settle time
    pub stepdelay: Option<f64>,
    /// Reuse a stored scan when present
    pub cache: bool,
    /// Fine (2 mV) instead of coarse (6 mV) steps
    pub full: bool,
    /// Run as background measurement
    pub background: bool,
}

impl Default for PinchOptions {
    fn default() -> Self {
        Self {
            basevalues: None,
            instrument: vec![MeasurementRef::Index(1)],
            stepdelay: None,
            cache: false,
            full: false,
            background: false,
        }
    }
}

/// Pinch-off scan of a single gate.
///
/// Sweeps `gate` from `max(base, 0)` down to -750 mV, puts the gate back to
/// its base value (or its value before the scan when no base is given),
/// stores the [`analyse_gate_sweep`] result under metadata `adata` and writes
/// the dataset to `<outputdir>/one_dot/`. With `cache` set, a stored scan is
/// loaded instead of measuring.
pub async fn scan_pinch_value(
    station: &Station,
    outputdir: &Path,
    gate: &str,
    options: &PinchOptions,
) -> AppResult<DataSet> {
    let outputfile = pinchoff_path(outputdir, gate);
    if options.cache && outputfile.exists() {
        info!(gate = %gate, path = %outputfile.display(), "skipping pinch-off scans for gate");
        return load_dataset(&outputfile);
    }

    let stepdelay = options
        .stepdelay
        .unwrap_or_else(|| wait_time(gate, None, station.settle_callback()));
    let base = options
        .basevalues
        .as_ref()
        .and_then(|values| values.get(gate))
        .copied();
    let reset_value = match base {
        Some(value) => value,
        None => station.gates().get(gate)?,
    };

    let step = if options.full { -2.0 } else { -6.0 };
    let start = base.unwrap_or(0.0).max(0.0);
    let scanjob = ScanJob::sweep(SweepData::new(gate, start, PINCH_END, step))
        .with_instrument(options.instrument.clone())
        .with_delay(stepdelay);
    let scan_options = ScanOptions::default()
        .with_title_comment(format!("scan gate {gate}"))
        .with_background(options.background);

    let result = scan_1d(station, &scanjob, &scan_options).await;
    let reset = station.gates().set(gate, reset_value);
    let mut dataset = match (result, reset) {
        (Ok(dataset), Ok(())) => dataset,
        (Ok(_), Err(e)) => return Err(e),
        (Err(e), Ok(())) => return Err(e),
        (Err(e), Err(reset_err)) => {
            warn!(gate = %gate, value = reset_value, error = %reset_err, "Failed to reset gate after pinch-off scan");
            return Err(e);
        }
    };

    let adata = analyse_gate_sweep(&dataset, None, None)?;
    info!(gate = %gate, pinch_value = adata.pinch_value, good_gate = adata.good_gate, "Pinch-off scan analysed");
    dataset.add_metadata("adata", &adata)?;

    dataset.location = Some(outputfile.display().to_string());
    write_dataset(&outputfile, &dataset)?;
    Ok(dataset)
}

/// 1D dataset from raw samples of a sweep centred on the gate's value.
///
/// The centre is `sweepgate_value` when given, else the current value of
/// `sweepgate` on `gates`. The setpoints are evenly spaced over `sweeprange`
/// and the samples are stored as `measured`.
pub fn make_dataset_sweep(
    data: &[f64],
    sweepgate: &str,
    sweeprange: f64,
    sweepgate_value: Option<f64>,
    gates: Option<&VirtualDac>,
) -> AppResult<DataSet> {
    let initval = match (sweepgate_value, gates) {
        (Some(value), _) => value,
        (None, Some(gates)) => gates.get(sweepgate)?,
        (None, None) => {
            return Err(TuningError::InvalidScanJob("No gates supplied".to_string()))
        }
    };
    let sweepvalues = linspace(
        initval - sweeprange / 2.0,
        initval + sweeprange / 2.0,
        data.len(),
    );
    make_dataset_1d_plain(sweepgate, &sweepvalues, &[MEASURED], Some(&[data.to_vec()]))
}

fn centred_axis(initval: f64, range: f64, count: usize) -> Vec<f64> {
    let step = range / count as f64;
    (0..count)
        .map(|k| initval - range / 2.0 + k as f64 * step)
        .collect()
}

/// 2D dataset from a raw image centred on the current gate values.
///
/// `sweepgates` is `[horizontal, vertical]`; columns of `data` follow the
/// horizontal gate. Each axis starts at `value - range / 2` with steps of
/// `range / pixels`.
pub fn make_dataset_sweep_2d(
    data: &Array2<f64>,
    gates: &VirtualDac,
    sweepgates: [&str; 2],
    sweepranges: [f64; 2],
) -> AppResult<DataSet> {
    let (rows, cols) = data.dim();
    let horz = centred_axis(gates.get(sweepgates[0])?, sweepranges[0], cols);
    let vert = centred_axis(gates.get(sweepgates[1])?, sweepranges[1], rows);
    make_dataset_2d_plain(
        sweepgates[0],
        &horz,
        sweepgates[1],
        &vert,
        &[MEASURED],
        Some(std::slice::from_ref(data)),
    )
}

/// Load the stored pinch-off scans of a one-dot and record their pinch values.
pub fn load_onedot_pinch_values(od: &mut OneDot, outputdir: &Path) -> AppResult<[f64; 3]> {
    info!(onedot = %od.name, "analyse data for 1-dot");
    let mut pinchvalues = [0.0; 3];
    for (slot, gate) in pinchvalues.iter_mut().zip(od.gates.iter()) {
        let path = pinchoff_path(outputdir, gate);
        if !path.exists() {
            return Err(TuningError::DatasetNotFound(path));
        }
        let dataset = load_dataset(&path)?;
        let adata = analyse_gate_sweep(&dataset, None, None)?;
        info!(gate = %gate, pinch_value = adata.pinch_value, "pinch value loaded");
        *slot = adata.pinch_value;
    }
    od.pinchvalues = Some(pinchvalues);
    Ok(pinchvalues)
}

/// Result of [`onedot_hires_scan`].
#[derive(Debug, Clone)]
pub struct ScanData {
    /// Updated one-dot
    pub od: OneDot,
    /// Measured high-resolution scan
    pub dataset: DataSet,
    /// Job that was run
    pub scanjob: ScanJob,
}

/// High-resolution 2D scan around the balance point of a one-dot.
///
/// Steps `gates[0]` and sweeps `gates[2]` over `±1.2 dv` around `ptv` (the
/// one-dot's balance point when `None`), clipped at -780 mV, in 4 mV steps.
/// The fine balance point replaces the coarse one only when its accuracy is
/// at least 0.2. Updates `coulombdirection`, `balancepointfine` and
/// `setpoint` of the one-dot and stores it under metadata `od`.
pub async fn onedot_hires_scan(
    station: &Station,
    mut od: OneDot,
    dv: f64,
    ptv: Option<[f64; 2]>,
) -> AppResult<ScanData> {
    info!(onedot = %od.name, dv, "onedotHiresScan");
    let ptv = ptv.or(od.balancepoint).ok_or_else(|| {
        TuningError::InvalidScanJob(format!("one-dot {} has no balance point", od.name))
    })?;

    let mut scanjob = create_scan_job(
        &od.gates[0],
        (ptv[1] + 1.2 * dv, ptv[1] - 1.2 * dv),
        Some(&od.gates[2]),
        Some((ptv[0] + 1.2 * dv, ptv[0] - 1.2 * dv)),
        Some(HIRES_STEP),
        Some(vec![od.instrument.clone()]),
    );
    for axis in [scanjob.stepdata.as_mut(), scanjob.sweepdata.as_mut()]
        .into_iter()
        .flatten()
    {
        axis.end = axis.end.max(HIRES_LIMIT);
    }

    let settle = wait_time(&od.gates[2], None, station.settle_callback());
    let options = ScanOptions::default()
        .with_wait_time(settle)
        .with_title_comment("2D scan, local");
    let mut dataset = scan_2d(station, &scanjob, &options).await?;

    let (image, transform) = dataset_to_image(&dataset, None)?;
    let fine = onedot_balance_fine(&image, &transform)?;

    let (point, pixel) = if fine.accuracy < HIRES_MIN_ACCURACY {
        info!(accuracy = fine.accuracy, "use old data point");
        let point = od.balancepoint.unwrap_or(ptv);
        let pixel = od
            .balancepointpixel
            .unwrap_or_else(|| transform.scan_to_pixel(point));
        (point, pixel)
    } else {
        (fine.point, fine.pixel)
    };

    let step = scanjob.require_stepdata()?.step;
    od.coulombdirection = Some(find_coulomb_direction(&image, pixel, step, COULOMB_WIDTH_MV)?);
    od.balancepointfine = Some(point);
    od.setpoint = Some([point[0] + SETPOINT_OFFSET, point[1] + SETPOINT_OFFSET]);
    dataset.add_metadata("od", &od)?;

    Ok(ScanData {
        od,
        dataset,
        scanjob,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{ChannelRef, GateMap};
    use crate::instrument::{DacInstrument, VirtualIvvi};
    use std::sync::Arc;

    fn dac() -> VirtualDac {
        let ivvi: Arc<dyn DacInstrument> = Arc::new(VirtualIvvi::new("ivvi"));
        let mut map = GateMap::new();
        map.insert("L".into(), ChannelRef::index(0, 1));
        map.insert("R".into(), ChannelRef::index(0, 2));
        VirtualDac::new("gates", vec![ivvi], map)
    }

    #[test]
    fn wait_time_precedence() {
        let station = Station::new(Arc::new(dac()));
        assert_eq!(wait_time("L", Some(&station), None), DEFAULT_WAIT_TIME);
        assert_eq!(wait_time("L", None, None), DEFAULT_WAIT_TIME);

        let station = station.with_gate_settle(Arc::new(|g: &str| if g == "L" { 0.5 } else { 0.1 }));
        assert_eq!(wait_time("L", Some(&station), None), 0.5);

        let explicit: GateSettle = Arc::new(|_: &str| 2.0);
        assert_eq!(wait_time("L", Some(&station), Some(&explicit)), 2.0);
    }

    #[test]
    fn pinchoff_filenames() {
        assert_eq!(pinchoff_filename("L", None), "pinchoff-sweep-1d-L");
        let od = OneDot::new("dot1", ["L", "P1", "R"], MeasurementRef::Index(1));
        assert_eq!(pinchoff_filename("P1", Some(&od)), "dot1-sweep-1d-P1");
    }

    #[test]
    fn sweep_dataset_is_centred() {
        let gates = dac();
        gates.set("L", -100.0).unwrap();
        let ds = make_dataset_sweep(&[1.0, 2.0, 3.0, 4.0, 5.0], "L", 40.0, None, Some(&gates)).unwrap();
        assert_eq!(ds.array("L").unwrap().data, vec![-120.0, -110.0, -100.0, -90.0, -80.0]);
        assert_eq!(ds.array(MEASURED).unwrap().data, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let ds = make_dataset_sweep(&[1.0, 2.0, 3.0], "L", 2.0, Some(5.0), None).unwrap();
        assert_eq!(ds.array("L").unwrap().data, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn sweep_dataset_needs_gates_or_value() {
        let err = make_dataset_sweep(&[1.0], "L", 2.0, None, None).unwrap_err();
        assert!(err.to_string().contains("No gates supplied"));
    }

    #[test]
    fn sweep_dataset_2d_axes() {
        let gates = dac();
        gates.set("L", 10.0).unwrap();
        gates.set("R", -20.0).unwrap();
        let data = Array2::from_shape_fn((2, 4), |(r, c)| (r * 4 + c) as f64);
        let ds = make_dataset_sweep_2d(&data, &gates, ["L", "R"], [8.0, 4.0]).unwrap();

        assert_eq!(ds.array("R").unwrap().data, vec![-22.0, -20.0]);
        let horizontal = ds.array("L").unwrap();
        assert_eq!(horizontal.shape, vec![2, 4]);
        assert_eq!(&horizontal.data[..4], &[6.0, 8.0, 10.0, 12.0]);
        assert_eq!(ds.array(MEASURED).unwrap().to_array2().unwrap(), data);
    }
}
