//! Plan system for gate sweeps
//!
//! Plans are declarative generators that yield commands for the
//! [`RunEngine`](crate::run_engine::RunEngine) to execute. A plan does not touch
//! hardware; it describes the order of gate moves, settle waits and detector
//! reads, and the engine carries them out.
//!
//! # Plan Commands
//!
//! - `MoveTo` - set a gate to a value
//! - `Wait` - wait for a duration
//! - `Checkpoint` - safe point where an abort is honoured
//! - `Read` - read a detector
//! - `EmitEvent` - store the collected reads at a point of the dataset
//!
//! # Example
//!
//! ```rust
//! use qdot_tuning::plans::{LineScan, Plan, PlanCommand};
//! use qdot_tuning::sweep::SweepValues;
//!
//! let sweep = SweepValues::new("L", 0.0, -30.0, 10.0, None).unwrap();
//! let mut plan = LineScan::new(sweep).with_detector("keithley1");
//!
//! let moves: Vec<f64> = std::iter::from_fn(|| plan.next_command())
//!     .filter_map(|cmd| match cmd {
//!         PlanCommand::MoveTo { value, .. } => Some(value),
//!         _ => None,
//!     })
//!     .collect();
//! assert_eq!(moves, vec![0.0, -10.0, -20.0]);
//! ```

use std::collections::BTreeMap;

use crate::sweep::SweepValues;

/// Commands that plans yield for the RunEngine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Set a gate to an absolute value
    MoveTo {
        /// Gate to move
        gate: String,
        /// Target value
        value: f64,
    },
    /// Wait for a duration in seconds
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Checkpoint - safe point for abort
    Checkpoint {
        /// Checkpoint label
        label: String,
    },
    /// Read a value from a detector
    Read {
        /// Detector to read
        detector: String,
    },
    /// Store the reads collected since the last event
    EmitEvent {
        /// Flat (row-major) index of the point in the dataset
        index: usize,
        /// Gate values at the point
        positions: BTreeMap<String, f64>,
    },
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "line_scan", "grid_scan")
    fn plan_type(&self) -> &str;

    /// Gates that will be moved, outer axis first
    fn movers(&self) -> Vec<String>;

    /// Detectors that will be read
    fn detectors(&self) -> Vec<String>;

    /// Setpoints of every moved gate, outer axis first
    fn setpoints(&self) -> Vec<SweepValues>;

    /// Total number of points in the scan
    fn num_points(&self) -> usize;

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;
}

/// Line scan - sweep a single gate with one or more detectors
#[derive(Debug, Clone)]
pub struct LineScan {
    sweep: SweepValues,
    detectors: Vec<String>,
    delay: f64,

    // Execution state
    current_point: usize,
    current_step: LineScanStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineScanStep {
    Move,
    Settle,
    Checkpoint,
    ReadDetectors { detector_idx: usize },
    EmitEvent,
}

impl LineScan {
    /// Create a new LineScan over explicit sweep values
    pub fn new(sweep: SweepValues) -> Self {
        Self {
            sweep,
            detectors: Vec::new(),
            delay: 0.0,
            current_point: 0,
            current_step: LineScanStep::Move,
        }
    }

    /// Add a detector to the scan
    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    /// Add multiple detectors to the scan
    pub fn with_detectors(mut self, detectors: &[String]) -> Self {
        self.detectors.extend(detectors.iter().cloned());
        self
    }

    /// Wait this many seconds after every gate move
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }

    fn position_at(&self, point: usize) -> f64 {
        self.sweep.values()[point]
    }
}

impl Plan for LineScan {
    fn plan_type(&self) -> &str {
        "line_scan"
    }

    fn movers(&self) -> Vec<String> {
        vec![self.sweep.gate().to_string()]
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn setpoints(&self) -> Vec<SweepValues> {
        vec![self.sweep.clone()]
    }

    fn num_points(&self) -> usize {
        self.sweep.len()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.current_point >= self.sweep.len() {
            return None;
        }

        let cmd = match self.current_step {
            LineScanStep::Move => {
                self.current_step = if self.delay > 0.0 {
                    LineScanStep::Settle
                } else {
                    LineScanStep::Checkpoint
                };
                PlanCommand::MoveTo {
                    gate: self.sweep.gate().to_string(),
                    value: self.position_at(self.current_point),
                }
            }
            LineScanStep::Settle => {
                self.current_step = LineScanStep::Checkpoint;
                PlanCommand::Wait {
                    seconds: self.delay,
                }
            }
            LineScanStep::Checkpoint => {
                self.current_step = LineScanStep::ReadDetectors { detector_idx: 0 };
                PlanCommand::Checkpoint {
                    label: format!("point_{}", self.current_point),
                }
            }
            LineScanStep::ReadDetectors { detector_idx } => {
                if let Some(det) = self.detectors.get(detector_idx) {
                    self.current_step = LineScanStep::ReadDetectors {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Read {
                        detector: det.clone(),
                    }
                } else {
                    self.current_step = LineScanStep::EmitEvent;
                    return self.next_command();
                }
            }
            LineScanStep::EmitEvent => {
                let mut positions = BTreeMap::new();
                positions.insert(
                    self.sweep.gate().to_string(),
                    self.position_at(self.current_point),
                );
                let index = self.current_point;

                self.current_point += 1;
                self.current_step = LineScanStep::Move;

                PlanCommand::EmitEvent { index, positions }
            }
        };

        Some(cmd)
    }
}

/// Grid scan - step one gate and sweep another in raster order
///
/// For every outer value the inner sweep restarts from its first value.
#[derive(Debug, Clone)]
pub struct GridScan {
    outer: SweepValues,
    inner: SweepValues,
    detectors: Vec<String>,
    delay: f64,

    // Execution state
    outer_idx: usize,
    inner_idx: usize,
    current_step: GridScanStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GridScanStep {
    MoveOuter,
    SettleOuter,
    MoveInner,
    SettleInner,
    Checkpoint,
    ReadDetectors { detector_idx: usize },
    EmitEvent,
}

impl GridScan {
    /// Create a grid scan stepping `outer` and sweeping `inner`
    pub fn new(outer: SweepValues, inner: SweepValues) -> Self {
        Self {
            outer,
            inner,
            detectors: Vec::new(),
            delay: 0.0,
            outer_idx: 0,
            inner_idx: 0,
            current_step: GridScanStep::MoveOuter,
        }
    }

    /// Add a detector to the scan
    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    /// Add multiple detectors to the scan
    pub fn with_detectors(mut self, detectors: &[String]) -> Self {
        self.detectors.extend(detectors.iter().cloned());
        self
    }

    /// Wait this many seconds after every gate move, on both axes
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }

    fn settle_or(&self, next: GridScanStep, settle: GridScanStep) -> GridScanStep {
        if self.delay > 0.0 {
            settle
        } else {
            next
        }
    }
}

impl Plan for GridScan {
    fn plan_type(&self) -> &str {
        "grid_scan"
    }

    fn movers(&self) -> Vec<String> {
        vec![self.outer.gate().to_string(), self.inner.gate().to_string()]
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn setpoints(&self) -> Vec<SweepValues> {
        vec![self.outer.clone(), self.inner.clone()]
    }

    fn num_points(&self) -> usize {
        self.outer.len() * self.inner.len()
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.outer_idx >= self.outer.len() || self.inner.is_empty() {
            return None;
        }

        let cmd = match self.current_step {
            GridScanStep::MoveOuter => {
                self.current_step =
                    self.settle_or(GridScanStep::MoveInner, GridScanStep::SettleOuter);
                PlanCommand::MoveTo {
                    gate: self.outer.gate().to_string(),
                    value: self.outer.values()[self.outer_idx],
                }
            }
            GridScanStep::SettleOuter => {
                self.current_step = GridScanStep::MoveInner;
                PlanCommand::Wait {
                    seconds: self.delay,
                }
            }
            GridScanStep::MoveInner => {
                self.current_step =
                    self.settle_or(GridScanStep::Checkpoint, GridScanStep::SettleInner);
                PlanCommand::MoveTo {
                    gate: self.inner.gate().to_string(),
                    value: self.inner.values()[self.inner_idx],
                }
            }
            GridScanStep::SettleInner => {
                self.current_step = GridScanStep::Checkpoint;
                PlanCommand::Wait {
                    seconds: self.delay,
                }
            }
            GridScanStep::Checkpoint => {
                self.current_step = GridScanStep::ReadDetectors { detector_idx: 0 };
                PlanCommand::Checkpoint {
                    label: format!("point_{}_{}", self.outer_idx, self.inner_idx),
                }
            }
            GridScanStep::ReadDetectors { detector_idx } => {
                if let Some(det) = self.detectors.get(detector_idx) {
                    self.current_step = GridScanStep::ReadDetectors {
                        detector_idx: detector_idx + 1,
                    };
                    PlanCommand::Read {
                        detector: det.clone(),
                    }
                } else {
                    self.current_step = GridScanStep::EmitEvent;
                    return self.next_command();
                }
            }
            GridScanStep::EmitEvent => {
                let mut positions = BTreeMap::new();
                positions.insert(
                    self.outer.gate().to_string(),
                    self.outer.values()[self.outer_idx],
                );
                positions.insert(
                    self.inner.gate().to_string(),
                    self.inner.values()[self.inner_idx],
                );
                let index = self.outer_idx * self.inner.len() + self.inner_idx;

                // Raster pattern: inner axis always restarts from 0
                self.inner_idx += 1;
                if self.inner_idx >= self.inner.len() {
                    self.inner_idx = 0;
                    self.outer_idx += 1;
                    self.current_step = GridScanStep::MoveOuter;
                } else {
                    self.current_step = GridScanStep::MoveInner;
                }

                PlanCommand::EmitEvent { index, positions }
            }
        };

        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(gate: &str, start: f64, end: f64, step: f64) -> SweepValues {
        SweepValues::new(gate, start, end, step, None).unwrap()
    }

    #[test]
    fn test_line_scan_commands() {
        let mut plan = LineScan::new(sweep("L", 0.0, -30.0, 10.0))
            .with_detector("keithley1")
            .with_delay(0.1);

        let mut commands = Vec::new();
        while let Some(cmd) = plan.next_command() {
            commands.push(cmd);
        }

        // Each point: Move, Wait, Checkpoint, Read, EmitEvent
        assert_eq!(commands.len(), 15);
        assert_eq!(
            commands[0],
            PlanCommand::MoveTo {
                gate: "L".into(),
                value: 0.0
            }
        );
        assert_eq!(commands[1], PlanCommand::Wait { seconds: 0.1 });
        assert!(matches!(commands[4], PlanCommand::EmitEvent { index: 0, .. }));
    }

    #[test]
    fn test_line_scan_without_delay_skips_wait() {
        let mut plan = LineScan::new(sweep("L", 0.0, -20.0, 10.0));
        let waits = std::iter::from_fn(|| plan.next_command())
            .filter(|c| matches!(c, PlanCommand::Wait { .. }))
            .count();
        assert_eq!(waits, 0);
    }

    #[test]
    fn test_grid_scan_raster_order() {
        let mut plan = GridScan::new(sweep("L", 0.0, -30.0, 10.0), sweep("R", 0.0, -20.0, 10.0))
            .with_detector("keithley1");

        let mut events = Vec::new();
        while let Some(cmd) = plan.next_command() {
            if let PlanCommand::EmitEvent { index, positions } = cmd {
                events.push((index, positions["L"], positions["R"]));
            }
        }

        assert_eq!(plan.num_points(), 6);
        assert_eq!(
            events,
            vec![
                (0, 0.0, 0.0),
                (1, 0.0, -10.0),
                (2, -10.0, 0.0),
                (3, -10.0, -10.0),
                (4, -20.0, 0.0),
                (5, -20.0, -10.0),
            ]
        );
    }

    #[test]
    fn test_grid_scan_settles_both_axes() {
        let mut plan = GridScan::new(sweep("L", 0.0, -10.0, 10.0), sweep("R", 0.0, -20.0, 10.0))
            .with_delay(0.01);
        let waits = std::iter::from_fn(|| plan.next_command())
            .filter(|c| matches!(c, PlanCommand::Wait { .. }))
            .count();
        // one outer settle plus two inner settles
        assert_eq!(waits, 3);
    }
}
