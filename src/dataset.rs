//! Dataset model and JSON persistence.
//!
//! A [`DataSet`] is an insertion-ordered collection of named [`DataArray`]s
//! plus free-form JSON metadata. Setpoint arrays hold the swept gate values;
//! measured arrays reference them through `set_arrays`, outer axis first.
//!
//! For a 2D scan with step gate `L` (outer) and sweep gate `R` (inner):
//!
//! | array      | shape      | set_arrays |
//! |------------|------------|------------|
//! | `L`        | `[ny]`     | `[L]`      |
//! | `R`        | `[ny, nx]` | `[L, R]`   |
//! | `keithley1`| `[ny, nx]` | `[L, R]`   |
//!
//! Datasets are written as JSON dictionaries; non-finite values are stored as
//! `null` so unfinished scans survive a round trip.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use indexmap::IndexMap;
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{AppResult, TuningError};
use crate::sweep::SweepValues;

/// Name of the measured array created by the sweep dataset helpers.
pub const MEASURED: &str = "measured";

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|v| v.is_finite().then_some(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

fn format_shape(shape: &[usize]) -> String {
    match shape {
        [n] => format!("({n},)"),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

// =============================================================================
// DataArray
// =============================================================================

/// One named array of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    /// Array name, unique within the dataset
    pub name: String,
    /// Display label, falls back to `name` when empty
    #[serde(default)]
    pub label: String,
    /// Unit of the values
    #[serde(default)]
    pub unit: String,
    /// Whether the array holds setpoints
    #[serde(default)]
    pub is_setpoint: bool,
    /// Shape, row-major
    pub shape: Vec<usize>,
    /// Values in row-major order
    #[serde(
        default,
        rename = "array",
        with = "nan_as_null",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub data: Vec<f64>,
    /// Setpoint arrays this array is indexed by, outer axis first
    #[serde(default)]
    pub set_arrays: Vec<String>,
}

impl DataArray {
    /// 1D setpoint array
    pub fn setpoint(name: &str, values: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            unit: String::new(),
            is_setpoint: true,
            shape: vec![values.len()],
            data: values,
            set_arrays: vec![name.to_string()],
        }
    }

    /// Measured array with explicit shape
    pub fn measured(name: &str, shape: Vec<usize>, data: Vec<f64>, set_arrays: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            unit: String::new(),
            is_setpoint: false,
            shape,
            data,
            set_arrays,
        }
    }

    /// Set the unit
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the array holds no values
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Label, optionally with the unit in brackets
    pub fn label_text(&self, add_unit: bool) -> String {
        let label = if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        };
        if add_unit {
            let unit = if self.unit.is_empty() { "None" } else { &self.unit };
            format!("{label} [{unit}]")
        } else {
            label.clone()
        }
    }

    /// Store `value` at flat index `index`.
    pub fn set_value(&mut self, index: usize, value: f64) -> AppResult<()> {
        let len = self.data.len();
        let slot = self.data.get_mut(index).ok_or_else(|| {
            TuningError::DatasetShape(format!(
                "index {index} out of range for array {} of length {len}",
                self.name
            ))
        })?;
        *slot = value;
        Ok(())
    }

    /// View the values as a 2D array.
    pub fn to_array2(&self) -> AppResult<Array2<f64>> {
        let (rows, cols) = match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            [n] => (1, *n),
            other => {
                return Err(TuningError::DatasetShape(format!(
                    "array {} has shape {}, expected 2D",
                    self.name,
                    format_shape(other)
                )))
            }
        };
        Array2::from_shape_vec((rows, cols), self.data.clone())
            .map_err(|e| TuningError::DatasetShape(format!("array {}: {e}", self.name)))
    }

    fn fill_missing(&mut self) {
        let expected: usize = self.shape.iter().product();
        if self.data.is_empty() && expected > 0 {
            self.data = vec![f64::NAN; expected];
        }
    }
}

// =============================================================================
// DataSet
// =============================================================================

/// Collection of arrays with metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    /// Where the dataset was loaded from or should be written to
    pub location: Option<String>,
    arrays: IndexMap<String, DataArray>,
    /// Free-form metadata
    pub metadata: Map<String, Value>,
}

impl DataSet {
    /// Empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an array, replacing one with the same name.
    pub fn add_array(&mut self, array: DataArray) {
        self.arrays.insert(array.name.clone(), array);
    }

    /// Look up an array by name.
    pub fn array(&self, name: &str) -> AppResult<&DataArray> {
        self.arrays
            .get(name)
            .ok_or_else(|| TuningError::MissingArray(name.to_string()))
    }

    /// Mutable access to an array.
    pub fn array_mut(&mut self, name: &str) -> AppResult<&mut DataArray> {
        self.arrays
            .get_mut(name)
            .ok_or_else(|| TuningError::MissingArray(name.to_string()))
    }

    /// All arrays in insertion order.
    pub fn arrays(&self) -> impl Iterator<Item = &DataArray> {
        self.arrays.values()
    }

    /// Array names in insertion order.
    pub fn array_names(&self) -> Vec<String> {
        self.arrays.keys().cloned().collect()
    }

    /// Measured (non-setpoint) arrays in insertion order.
    pub fn measured_arrays(&self) -> impl Iterator<Item = &DataArray> {
        self.arrays.values().filter(|a| !a.is_setpoint)
    }

    /// Name of the array plots and analyses use by default.
    ///
    /// Preference: `amplitude`, `amplitude_0`, `amplitude_1`, any name ending in
    /// `amplitude`, then the first measured array.
    pub fn default_parameter_name(&self) -> Option<String> {
        for name in ["amplitude", "amplitude_0", "amplitude_1"] {
            if self.arrays.contains_key(name) {
                return Some(name.to_string());
            }
        }
        if let Some(name) = self.arrays.keys().find(|n| n.ends_with("amplitude")) {
            return Some(name.clone());
        }
        self.measured_arrays().next().map(|a| a.name.clone())
    }

    /// The array named by [`DataSet::default_parameter_name`].
    pub fn default_parameter(&self) -> AppResult<&DataArray> {
        let name = self
            .default_parameter_name()
            .ok_or_else(|| TuningError::MissingArray("<default parameter>".to_string()))?;
        self.array(&name)
    }

    /// Store a serializable value under `key` in the metadata.
    pub fn add_metadata<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> AppResult<()> {
        self.metadata
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a metadata entry back into a typed value.
    pub fn metadata_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        self.metadata
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(TuningError::from)
    }

    fn resolve(&self, arrayname: Option<&str>) -> AppResult<&DataArray> {
        match arrayname {
            Some(name) => self.array(name),
            None => self.default_parameter(),
        }
    }
}

// =============================================================================
// Construction
// =============================================================================

fn check_measurement_count(names: usize, measurements: usize) -> AppResult<()> {
    if names != measurements {
        return Err(TuningError::DatasetShape(format!(
            "The number of measurement names {names} does not match the number of measurements {measurements}"
        )));
    }
    Ok(())
}

fn warn_shape_mismatch(measured: &[usize], setpoint: &[usize]) {
    warn!(
        "Shape of measured data {} does not match setpoint shape {}",
        format_shape(measured),
        format_shape(setpoint)
    );
}

/// 1D dataset from a gate sweep with one measured array.
pub fn make_dataset_1d(
    sweep: &SweepValues,
    yname: &str,
    ydata: Option<&[f64]>,
) -> AppResult<DataSet> {
    let rows = ydata.map(|y| vec![y.to_vec()]);
    make_dataset_1d_plain(sweep.gate(), sweep.values(), &[yname], rows.as_deref())
}

/// 1D dataset from plain values.
///
/// `ydata` holds one row per entry of `ynames`; a count mismatch is an error.
/// A row whose length differs from `x` is stored as given with a warning.
/// Without data the measured arrays are filled with NaN.
pub fn make_dataset_1d_plain(
    xname: &str,
    x: &[f64],
    ynames: &[&str],
    ydata: Option<&[Vec<f64>]>,
) -> AppResult<DataSet> {
    if let Some(rows) = ydata {
        check_measurement_count(ynames.len(), rows.len())?;
    }

    let mut dataset = DataSet::new();
    dataset.add_array(DataArray::setpoint(xname, x.to_vec()));

    let setpoint_shape = vec![x.len()];
    for (idx, yname) in ynames.iter().enumerate() {
        let data = match ydata {
            Some(rows) => {
                let row = rows[idx].clone();
                if row.len() != x.len() {
                    warn_shape_mismatch(&[row.len()], &setpoint_shape);
                }
                row
            }
            None => vec![f64::NAN; x.len()],
        };
        let shape = vec![data.len()];
        dataset.add_array(DataArray::measured(
            yname,
            shape,
            data,
            vec![xname.to_string()],
        ));
    }

    debug!(setpoint = xname, points = x.len(), "Created 1D dataset");
    Ok(dataset)
}

/// 2D dataset from a step sweep (outer) and a sweep (inner).
pub fn make_dataset_2d(
    step: &SweepValues,
    sweep: &SweepValues,
    znames: &[&str],
    zdata: Option<&[Array2<f64>]>,
) -> AppResult<DataSet> {
    make_dataset_2d_plain(
        sweep.gate(),
        sweep.values(),
        step.gate(),
        step.values(),
        znames,
        zdata,
    )
}

/// 2D dataset from plain values.
///
/// `x` is the horizontal (inner) axis and `y` the vertical (outer) axis; the
/// measured arrays have shape `(len(y), len(x))`.
pub fn make_dataset_2d_plain(
    xname: &str,
    x: &[f64],
    yname: &str,
    y: &[f64],
    znames: &[&str],
    zdata: Option<&[Array2<f64>]>,
) -> AppResult<DataSet> {
    if xname == yname {
        return Err(TuningError::DatasetShape(format!(
            "horizontal and vertical setpoints must differ, both are {xname}"
        )));
    }
    if let Some(images) = zdata {
        check_measurement_count(znames.len(), images.len())?;
    }

    let (ny, nx) = (y.len(), x.len());
    let set_arrays = vec![yname.to_string(), xname.to_string()];

    let mut dataset = DataSet::new();
    dataset.add_array(DataArray::setpoint(yname, y.to_vec()));

    let tiled: Vec<f64> = (0..ny).flat_map(|_| x.iter().copied()).collect();
    let mut inner = DataArray::setpoint(xname, tiled);
    inner.shape = vec![ny, nx];
    inner.set_arrays = set_arrays.clone();
    dataset.add_array(inner);

    for (idx, zname) in znames.iter().enumerate() {
        let (shape, data) = match zdata {
            Some(images) => {
                let image = &images[idx];
                let shape = image.shape().to_vec();
                if shape != [ny, nx] {
                    warn_shape_mismatch(&shape, &[ny, nx]);
                }
                (shape, image.iter().copied().collect())
            }
            None => (vec![ny, nx], vec![f64::NAN; ny * nx]),
        };
        dataset.add_array(DataArray::measured(zname, shape, data, set_arrays.clone()));
    }

    debug!(horizontal = xname, vertical = yname, nx, ny, "Created 2D dataset");
    Ok(dataset)
}

// =============================================================================
// Inspection
// =============================================================================

/// Axis selector for [`dataset_labels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAxis {
    /// The measured (dependent) array
    Measured,
    /// Setpoint axis, 0 is horizontal (`x`), 1 is vertical (`y`)
    Setpoint(usize),
}

impl From<&str> for LabelAxis {
    fn from(value: &str) -> Self {
        match value {
            "x" => LabelAxis::Setpoint(0),
            "y" => LabelAxis::Setpoint(1),
            _ => LabelAxis::Measured,
        }
    }
}

impl From<usize> for LabelAxis {
    fn from(value: usize) -> Self {
        LabelAxis::Setpoint(value)
    }
}

/// Label of the default array or of one of its setpoint axes.
pub fn dataset_labels(dataset: &DataSet, axis: LabelAxis, add_unit: bool) -> AppResult<String> {
    let array = dataset.default_parameter()?;
    let target = match axis {
        LabelAxis::Measured => array,
        LabelAxis::Setpoint(idx) => {
            let n = array.set_arrays.len();
            let name = n
                .checked_sub(idx + 1)
                .and_then(|pos| array.set_arrays.get(pos))
                .ok_or_else(|| TuningError::MissingArray(format!("setpoint axis {idx}")))?;
            dataset.array(name)?
        }
    };
    Ok(target.label_text(add_unit))
}

/// Store a free-text comment in the dataset metadata.
pub fn add_comment(dataset: &mut DataSet, comment: &str) {
    dataset
        .metadata
        .insert("comment".to_string(), Value::String(comment.to_string()));
}

/// Axis information of a 1D dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata1D {
    /// First and last setpoint value
    pub extent: [f64; 2],
    /// Swept gate
    pub gate: String,
    /// Setpoint values
    pub vsweep: Vec<f64>,
    /// Measured array the metadata was derived for
    pub arrayname: String,
}

/// Axis information of a 1D dataset.
pub fn dataset_1d_metadata(dataset: &DataSet, arrayname: Option<&str>) -> AppResult<Metadata1D> {
    let array = dataset.resolve(arrayname)?;
    let gate = array
        .set_arrays
        .first()
        .ok_or_else(|| TuningError::MissingArray(format!("setpoints of {}", array.name)))?;
    let vsweep = dataset.array(gate)?.data.clone();
    let extent = match (vsweep.first(), vsweep.last()) {
        (Some(first), Some(last)) => [*first, *last],
        _ => [f64::NAN, f64::NAN],
    };
    Ok(Metadata1D {
        extent,
        gate: gate.clone(),
        vsweep,
        arrayname: array.name.clone(),
    })
}

/// Axis information of a 2D dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata2D {
    /// `[sweep first, sweep last, step first, step last]`
    pub extent: [f64; 4],
    /// Inner (horizontal) gate
    pub sweep_gate: String,
    /// Outer (vertical) gate
    pub step_gate: String,
    /// Outer setpoint values
    pub vstep: Vec<f64>,
    /// Inner setpoint values
    pub vsweep: Vec<f64>,
    /// Measured array the metadata was derived for
    pub arrayname: String,
}

/// Axis information of a 2D dataset.
pub fn dataset_2d_metadata(dataset: &DataSet, arrayname: Option<&str>) -> AppResult<Metadata2D> {
    let array = dataset.resolve(arrayname)?;
    let [step_gate, sweep_gate] = array.set_arrays.as_slice() else {
        return Err(TuningError::DatasetShape(format!(
            "array {} is not two-dimensional",
            array.name
        )));
    };

    let vstep = dataset.array(step_gate)?.data.clone();
    let inner = dataset.array(sweep_gate)?;
    let nx = inner.shape.last().copied().unwrap_or(0);
    let vsweep: Vec<f64> = inner.data.iter().take(nx).copied().collect();

    let first_last = |v: &[f64]| match (v.first(), v.last()) {
        (Some(a), Some(b)) => (*a, *b),
        _ => (f64::NAN, f64::NAN),
    };
    let (sx0, sx1) = first_last(vsweep.as_slice());
    let (sy0, sy1) = first_last(vstep.as_slice());

    Ok(Metadata2D {
        extent: [sx0, sx1, sy0, sy1],
        sweep_gate: sweep_gate.clone(),
        step_gate: step_gate.clone(),
        vstep,
        vsweep,
        arrayname: array.name.clone(),
    })
}

/// Mapping between image pixels and gate values.
///
/// Pixels are `[column, row]`; columns follow the sweep gate and rows the step
/// gate, both in increasing voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTransform {
    /// Sweep values along the columns
    pub vsweep: Vec<f64>,
    /// Step values along the rows
    pub vstep: Vec<f64>,
    /// Whether the columns were reversed from scan order
    pub flipped_x: bool,
    /// Whether the rows were reversed from scan order
    pub flipped_y: bool,
}

fn axis_value(values: &[f64], pixel: f64) -> f64 {
    match values {
        [] => f64::NAN,
        [only] => *only,
        [first, .., last] => first + pixel * (last - first) / (values.len() - 1) as f64,
    }
}

fn axis_pixel(values: &[f64], value: f64) -> f64 {
    match values {
        [first, .., last] if last != first => {
            (value - first) * (values.len() - 1) as f64 / (last - first)
        }
        _ => 0.0,
    }
}

impl ImageTransform {
    /// Gate values `[sweep, step]` at a (fractional) pixel.
    pub fn pixel_to_scan(&self, pixel: [f64; 2]) -> [f64; 2] {
        [
            axis_value(&self.vsweep, pixel[0]),
            axis_value(&self.vstep, pixel[1]),
        ]
    }

    /// Pixel position of gate values `[sweep, step]`.
    pub fn scan_to_pixel(&self, value: [f64; 2]) -> [f64; 2] {
        [
            axis_pixel(&self.vsweep, value[0]),
            axis_pixel(&self.vstep, value[1]),
        ]
    }

    /// Sweep-gate step between neighbouring columns.
    pub fn scan_resolution(&self) -> f64 {
        match self.vsweep.as_slice() {
            [first, second, ..] => (second - first).abs(),
            _ => 0.0,
        }
    }
}

fn is_decreasing(values: &[f64]) -> bool {
    matches!(values, [first, .., last] if last < first)
}

/// Image of a 2D dataset with axes ordered by increasing voltage.
pub fn dataset_to_image(
    dataset: &DataSet,
    arrayname: Option<&str>,
) -> AppResult<(Array2<f64>, ImageTransform)> {
    let meta = dataset_2d_metadata(dataset, arrayname)?;
    let mut image = dataset.array(&meta.arrayname)?.to_array2()?;
    let mut vsweep = meta.vsweep;
    let mut vstep = meta.vstep;

    let flipped_x = is_decreasing(&vsweep);
    if flipped_x {
        image.invert_axis(ndarray::Axis(1));
        vsweep.reverse();
    }
    let flipped_y = is_decreasing(&vstep);
    if flipped_y {
        image.invert_axis(ndarray::Axis(0));
        vstep.reverse();
    }

    Ok((
        image,
        ImageTransform {
            vsweep,
            vstep,
            flipped_x,
            flipped_y,
        },
    ))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Centre of the scanned region: `[x]` for 1D, `[sweep, step]` for 2D.
pub fn dataset_centre(dataset: &DataSet) -> AppResult<Vec<f64>> {
    let array = dataset.default_parameter()?;
    match array.set_arrays.len() {
        1 => {
            let meta = dataset_1d_metadata(dataset, Some(&array.name))?;
            Ok(vec![mean(&meta.vsweep)])
        }
        2 => {
            let meta = dataset_2d_metadata(dataset, Some(&array.name))?;
            Ok(vec![mean(&meta.vsweep), mean(&meta.vstep)])
        }
        n => Err(TuningError::DatasetShape(format!(
            "cannot determine centre of a {n}-dimensional dataset"
        ))),
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct DataSetDictionary {
    #[serde(default)]
    location: Option<String>,
    arrays: IndexMap<String, DataArray>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

/// Convert a dataset to a JSON dictionary.
///
/// Without `include_data` the arrays keep their shape but drop their values;
/// without `include_metadata` the `metadata` entry is `null`.
pub fn dataset_to_dictionary(
    dataset: &DataSet,
    include_data: bool,
    include_metadata: bool,
) -> AppResult<Value> {
    let arrays = dataset
        .arrays
        .iter()
        .map(|(name, array)| {
            let mut array = array.clone();
            if !include_data {
                array.data.clear();
            }
            (name.clone(), array)
        })
        .collect();

    let dictionary = DataSetDictionary {
        location: dataset.location.clone(),
        arrays,
        metadata: include_metadata.then(|| dataset.metadata.clone()),
    };
    Ok(serde_json::to_value(dictionary)?)
}

/// Rebuild a dataset from [`dataset_to_dictionary`] output.
///
/// Arrays stored without values are filled with NaN.
pub fn dictionary_to_dataset(dictionary: &Value) -> AppResult<DataSet> {
    let dictionary: DataSetDictionary = serde_json::from_value(dictionary.clone())?;
    let mut arrays = dictionary.arrays;
    for array in arrays.values_mut() {
        array.fill_missing();
    }
    Ok(DataSet {
        location: dictionary.location,
        arrays,
        metadata: dictionary.metadata.unwrap_or_default(),
    })
}

/// Write a dataset with data and metadata as JSON, creating parent directories.
pub fn write_dataset(path: impl AsRef<Path>, dataset: &DataSet) -> AppResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let dictionary = dataset_to_dictionary(dataset, true, true)?;
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &dictionary)?;
    info!(path = %path.display(), arrays = dataset.arrays.len(), "Dataset written");
    Ok(())
}

/// Load a dataset written by [`write_dataset`].
pub fn load_dataset(path: impl AsRef<Path>) -> AppResult<DataSet> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let dictionary: Value = serde_json::from_reader(reader)?;
    let mut dataset = dictionary_to_dataset(&dictionary)?;
    if dataset.location.is_none() {
        dataset.location = Some(path.display().to_string());
    }
    debug!(path = %path.display(), "Dataset loaded");
    Ok(dataset)
}
