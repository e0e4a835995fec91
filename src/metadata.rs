//! Scan metadata attached to every measured dataset.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::dataset::DataSet;
use crate::error::AppResult;
use crate::scanjob::ScanJob;

/// What a scan records about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    /// Gate values when the scan finished
    pub allgatevalues: BTreeMap<String, f64>,
    /// Wall-clock start of the scan
    pub scantime: DateTime<Local>,
    /// Duration in seconds, `-1` when a background job had to be polled
    pub dt: f64,
    /// The job that produced the data
    pub scanjob: ScanJob,
}

impl ScanMetadata {
    /// Metadata for a scan that started at `scantime`.
    pub fn new(allgatevalues: BTreeMap<String, f64>, scantime: DateTime<Local>, scanjob: ScanJob) -> Self {
        Self {
            allgatevalues,
            scantime,
            dt: 0.0,
            scanjob,
        }
    }

    /// Set the duration.
    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Write every field as a top-level metadata entry.
    pub fn attach(&self, dataset: &mut DataSet) -> AppResult<()> {
        dataset.add_metadata("allgatevalues", &self.allgatevalues)?;
        dataset.add_metadata("scantime", &self.scantime)?;
        dataset.add_metadata("dt", &self.dt)?;
        dataset.add_metadata("scanjob", &self.scanjob)?;
        Ok(())
    }

    /// Read the metadata back, `None` when the dataset has no scan record.
    pub fn from_dataset(dataset: &DataSet) -> AppResult<Option<Self>> {
        let (Some(allgatevalues), Some(scantime), Some(dt), Some(scanjob)) = (
            dataset.metadata_as("allgatevalues")?,
            dataset.metadata_as("scantime")?,
            dataset.metadata_as("dt")?,
            dataset.metadata_as("scanjob")?,
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            allgatevalues,
            scantime,
            dt,
            scanjob,
        }))
    }
}
