//! RunEngine - executes sweep plans against gates and detectors
//!
//! The RunEngine takes a [`Plan`], moves gates through the [`VirtualDac`],
//! reads detectors and fills a [`DataSet`] point by point. Progress is
//! published on a broadcast channel as [`ScanEvent`]s.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐    run()    ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │ abort()
//!    │                      ▼
//!    │   next checkpoint ┌──────────┐
//!    └───────────────────│ Aborting │
//!                        └──────────┘
//! ```
//!
//! An aborted run returns the partially filled dataset; points that were
//! never measured stay NaN.
//!
//! [`BackgroundJobs`] runs an engine on a tokio task and keeps the handle of
//! the current background measurement so callers can poll or await it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::dataset::{make_dataset_1d_plain, make_dataset_2d, DataSet};
use crate::error::{AppResult, TuningError};
use crate::gates::VirtualDac;
use crate::instrument::Readable;
use crate::plans::{Plan, PlanCommand};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No plan running, ready to accept new plans
    Idle,
    /// Executing a plan
    Running,
    /// Aborting current plan (will return to Idle)
    Aborting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Aborting => write!(f, "aborting"),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// All points measured
    Success,
    /// Stopped at a checkpoint on request
    Abort,
    /// A gate move or detector read failed
    Fail,
}

/// Progress notifications published while a plan runs
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Run started
    Start {
        /// Plan type identifier
        plan_type: String,
        /// Total number of points
        num_points: usize,
    },
    /// One point measured
    Point {
        /// Flat index of the point
        index: usize,
        /// Gate values at the point
        positions: BTreeMap<String, f64>,
        /// Detector readings
        data: BTreeMap<String, f64>,
    },
    /// Run finished
    Stop {
        /// Exit status
        exit_status: ExitStatus,
        /// Number of points measured
        num_events: usize,
    },
}

/// The RunEngine orchestrates sweep execution
pub struct RunEngine {
    /// Gates moved by the plans
    gates: Arc<VirtualDac>,

    /// Detectors by name
    detectors: IndexMap<String, Arc<dyn Readable>>,

    /// Current engine state
    state: RwLock<EngineState>,

    /// Abort request flag
    abort_requested: RwLock<bool>,

    /// Event broadcast channel
    event_sender: broadcast::Sender<ScanEvent>,
}

impl RunEngine {
    /// Create a new RunEngine
    pub fn new(gates: Arc<VirtualDac>, detectors: Vec<Arc<dyn Readable>>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        let detectors = detectors
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect();

        Self {
            gates,
            detectors,
            state: RwLock::new(EngineState::Idle),
            abort_requested: RwLock::new(false),
            event_sender,
        }
    }

    /// Subscribe to scan events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_sender.subscribe()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Abort the running plan at its next checkpoint
    pub async fn abort(&self, reason: &str) -> AppResult<()> {
        let current_state = *self.state.read().await;
        match current_state {
            EngineState::Running => {
                info!(reason = %reason, "Abort requested");
                *self.abort_requested.write().await = true;
                *self.state.write().await = EngineState::Aborting;
                Ok(())
            }
            _ => Err(TuningError::Engine(format!(
                "Cannot abort: engine is {current_state}"
            ))),
        }
    }

    /// Execute a plan and return the measured dataset
    pub async fn run(&self, mut plan: Box<dyn Plan>) -> AppResult<DataSet> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                return Err(TuningError::Engine(format!(
                    "Cannot start: engine is {}",
                    *state
                )));
            }
            *state = EngineState::Running;
        }
        *self.abort_requested.write().await = false;

        let result = self.execute_plan(plan.as_mut()).await;

        *self.state.write().await = EngineState::Idle;
        result
    }

    async fn execute_plan(&self, plan: &mut dyn Plan) -> AppResult<DataSet> {
        let mut dataset = self.prepare_dataset(plan)?;

        info!(
            plan_type = %plan.plan_type(),
            num_points = plan.num_points(),
            movers = ?plan.movers(),
            "Plan execution started"
        );
        self.emit(ScanEvent::Start {
            plan_type: plan.plan_type().to_string(),
            num_points: plan.num_points(),
        });

        let started = Instant::now();
        let mut collected = BTreeMap::new();
        let mut num_events = 0usize;
        let mut exit_status = ExitStatus::Success;
        let mut failure = None;

        while let Some(cmd) = plan.next_command() {
            if let PlanCommand::Checkpoint { label } = &cmd {
                debug!(label = %label, "Checkpoint");
                if *self.abort_requested.read().await {
                    exit_status = ExitStatus::Abort;
                    break;
                }
                continue;
            }

            match self
                .process_command(cmd, &mut dataset, &mut collected)
                .await
            {
                Ok(event_emitted) => {
                    if event_emitted {
                        num_events += 1;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Plan execution failed");
                    exit_status = ExitStatus::Fail;
                    failure = Some(e);
                    break;
                }
            }
        }

        self.emit(ScanEvent::Stop {
            exit_status,
            num_events,
        });
        info!(
            exit_status = ?exit_status,
            num_events,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Plan execution complete"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(dataset),
        }
    }

    fn prepare_dataset(&self, plan: &dyn Plan) -> AppResult<DataSet> {
        let detectors = plan.detectors();
        for name in &detectors {
            if !self.detectors.contains_key(name) {
                return Err(TuningError::UnknownDetector(name.clone()));
            }
        }
        let names: Vec<&str> = detectors.iter().map(String::as_str).collect();

        match plan.setpoints().as_slice() {
            [sweep] => make_dataset_1d_plain(sweep.gate(), sweep.values(), &names, None),
            [step, sweep] => make_dataset_2d(step, sweep, &names, None),
            other => Err(TuningError::Engine(format!(
                "plans with {} axes are not supported",
                other.len()
            ))),
        }
    }

    /// Process a single plan command
    /// Returns true if an event was emitted
    async fn process_command(
        &self,
        cmd: PlanCommand,
        dataset: &mut DataSet,
        collected: &mut BTreeMap<String, f64>,
    ) -> AppResult<bool> {
        match cmd {
            PlanCommand::MoveTo { gate, value } => {
                debug!(gate = %gate, value, "Moving");
                self.gates.set(&gate, value)?;
                Ok(false)
            }

            PlanCommand::Wait { seconds } => {
                let duration = Duration::try_from_secs_f64(seconds).map_err(|e| {
                    TuningError::InvalidScanJob(format!("invalid delay {seconds}: {e}"))
                })?;
                sleep(duration).await;
                Ok(false)
            }

            PlanCommand::Read { detector } => {
                let device = self
                    .detectors
                    .get(&detector)
                    .ok_or_else(|| TuningError::UnknownDetector(detector.clone()))?;
                let value = device
                    .read()
                    .await
                    .map_err(|e| TuningError::Instrument(format!("{detector}: {e:#}")))?;
                collected.insert(detector, value);
                Ok(false)
            }

            PlanCommand::EmitEvent { index, positions } => {
                for (detector, value) in collected.iter() {
                    dataset.array_mut(detector)?.set_value(index, *value)?;
                }
                let data = std::mem::take(collected);
                self.emit(ScanEvent::Point {
                    index,
                    positions,
                    data,
                });
                Ok(true)
            }

            PlanCommand::Checkpoint { .. } => Ok(false),
        }
    }

    fn emit(&self, event: ScanEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_sender.send(event);
    }
}

// =============================================================================
// Background measurements
// =============================================================================

struct BackgroundJob {
    name: String,
    engine: Arc<RunEngine>,
    handle: JoinHandle<AppResult<DataSet>>,
    started: Instant,
}

/// Handle of the current background measurement.
///
/// At most one measurement runs in the background at a time. The job stays
/// registered after it finishes until [`BackgroundJobs::join`] collects it.
#[derive(Default)]
pub struct BackgroundJobs {
    current: Mutex<Option<BackgroundJob>>,
}

impl BackgroundJobs {
    /// Create an empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `plan` on `engine` in a tokio task.
    ///
    /// Fails when another background measurement has not finished yet.
    pub fn spawn(&self, engine: Arc<RunEngine>, plan: Box<dyn Plan>) -> AppResult<()> {
        let mut current = self.current.lock();
        if let Some(job) = current.as_ref() {
            if !job.handle.is_finished() {
                return Err(TuningError::Background(format!(
                    "background measurement {} is still running",
                    job.name
                )));
            }
            warn!(job = %job.name, "Discarding uncollected background measurement");
        }

        let name = plan.plan_type().to_string();
        let task_engine = Arc::clone(&engine);
        let handle = tokio::spawn(async move { task_engine.run(plan).await });
        info!(job = %name, "Background measurement started");

        *current = Some(BackgroundJob {
            name,
            engine,
            handle,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Name of the background measurement while it is still running
    pub fn current(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .filter(|job| !job.handle.is_finished())
            .map(|job| job.name.clone())
    }

    /// Whether a background measurement is still running
    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// Poll up to `attempts` times, `interval` apart, for the job to finish.
    ///
    /// Returns whether no measurement is running afterwards.
    pub async fn wait_finished(&self, attempts: u32, interval: Duration) -> bool {
        for attempt in 0..attempts {
            match self.current() {
                None => break,
                Some(name) => {
                    debug!(job = %name, attempt, "Waiting for background measurement");
                    sleep(interval).await;
                }
            }
        }
        let finished = !self.is_running();
        if !finished {
            info!("background job not finished");
        }
        finished
    }

    /// Abort the running measurement at its next checkpoint
    pub async fn abort(&self, reason: &str) -> AppResult<()> {
        let engine = self
            .current
            .lock()
            .as_ref()
            .map(|job| Arc::clone(&job.engine))
            .ok_or_else(|| TuningError::Background("no background measurement".to_string()))?;
        engine.abort(reason).await
    }

    /// Wait for the measurement to complete and take its result.
    pub async fn join(&self) -> AppResult<DataSet> {
        let job = self
            .current
            .lock()
            .take()
            .ok_or_else(|| TuningError::Background("no background measurement".to_string()))?;

        let result = job
            .handle
            .await
            .map_err(|e| TuningError::Background(format!("{} failed: {e}", job.name)))?;
        info!(
            job = %job.name,
            elapsed_ms = job.started.elapsed().as_millis() as u64,
            "Background measurement collected"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{ChannelRef, GateMap};
    use crate::instrument::{DacInstrument, VirtualIvvi};
    use crate::plans::{GridScan, LineScan};
    use crate::sweep::SweepValues;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    struct GateEcho {
        gates: Arc<VirtualDac>,
    }

    #[async_trait]
    impl Readable for GateEcho {
        fn name(&self) -> &str {
            "echo"
        }

        async fn read(&self) -> anyhow::Result<f64> {
            Ok(self.gates.get("L")? * 10.0 + self.gates.get("R")?)
        }
    }

    struct Broken;

    #[async_trait]
    impl Readable for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn read(&self) -> anyhow::Result<f64> {
            anyhow::bail!("integration timeout")
        }
    }

    fn setup() -> (Arc<VirtualDac>, RunEngine) {
        let ivvi: Arc<dyn DacInstrument> = Arc::new(VirtualIvvi::new("ivvi"));
        let mut map = GateMap::new();
        map.insert("L".into(), ChannelRef::index(0, 1));
        map.insert("R".into(), ChannelRef::index(0, 2));
        let gates = Arc::new(VirtualDac::new("gates", vec![ivvi], map));
        let engine = RunEngine::new(
            Arc::clone(&gates),
            vec![
                Arc::new(GateEcho {
                    gates: Arc::clone(&gates),
                }),
                Arc::new(Broken),
            ],
        );
        (gates, engine)
    }

    fn sweep(gate: &str, start: f64, end: f64, step: f64) -> SweepValues {
        SweepValues::new(gate, start, end, step, None).unwrap()
    }

    #[tokio::test]
    async fn test_grid_scan_fills_dataset() {
        let (gates, engine) = setup();
        let plan = GridScan::new(sweep("L", 1.0, 3.0, 1.0), sweep("R", 0.0, 3.0, 1.0))
            .with_detector("echo");

        let ds = engine.run(Box::new(plan)).await.unwrap();
        let echo = ds.array("echo").unwrap();
        assert_eq!(echo.shape, vec![2, 3]);
        assert_eq!(echo.data, vec![10.0, 11.0, 12.0, 20.0, 21.0, 22.0]);
        assert_eq!(gates.get("L").unwrap(), 2.0);
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test]
    async fn test_read_failure_fails_run() {
        let (_, engine) = setup();
        let mut rx = engine.subscribe();
        let plan = LineScan::new(sweep("L", 0.0, 2.0, 1.0)).with_detector("broken");

        let err = engine.run(Box::new(plan)).await.unwrap_err();
        assert!(err.to_string().contains("integration timeout"));
        assert_eq!(engine.state().await, EngineState::Idle);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(ScanEvent::Stop {
                exit_status: ExitStatus::Fail,
                num_events: 0
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_detector_is_rejected() {
        let (_, engine) = setup();
        let plan = LineScan::new(sweep("L", 0.0, 2.0, 1.0)).with_detector("keithley9");
        assert!(matches!(
            engine.run(Box::new(plan)).await,
            Err(TuningError::UnknownDetector(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_abort_idle_engine() {
        let (_, engine) = setup();
        assert!(engine.abort("test").await.is_err());
    }

    #[tokio::test]
    async fn test_background_job_lifecycle() {
        let (_, engine) = setup();
        let engine = Arc::new(engine);
        let jobs = BackgroundJobs::new();

        let plan = LineScan::new(sweep("L", 0.0, 5.0, 1.0))
            .with_detector("echo")
            .with_delay(0.02);
        jobs.spawn(Arc::clone(&engine), Box::new(plan)).unwrap();
        assert_eq!(jobs.current().as_deref(), Some("line_scan"));

        let again = LineScan::new(sweep("L", 0.0, 1.0, 1.0));
        assert!(jobs.spawn(Arc::clone(&engine), Box::new(again)).is_err());

        assert!(jobs.wait_finished(100, Duration::from_millis(10)).await);
        let ds = jobs.join().await.unwrap();
        assert_eq!(ds.array("echo").unwrap().data, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        assert!(jobs.join().await.is_err());
    }

    #[tokio::test]
    async fn test_background_abort_keeps_partial_data() {
        let (_, engine) = setup();
        let engine = Arc::new(engine);
        let jobs = BackgroundJobs::new();

        let plan = LineScan::new(sweep("L", 0.0, 200.0, 1.0))
            .with_detector("echo")
            .with_delay(0.01);
        jobs.spawn(Arc::clone(&engine), Box::new(plan)).unwrap();
        sleep(Duration::from_millis(50)).await;
        jobs.abort("operator").await.unwrap();

        let ds = jobs.join().await.unwrap();
        let echo = ds.array("echo").unwrap();
        assert!(!echo.data[0].is_nan());
        assert!(echo.data[199].is_nan());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_wait_finished_gives_up_on_long_job() {
        let (_, engine) = setup();
        let engine = Arc::new(engine);
        let jobs = BackgroundJobs::new();

        let plan = LineScan::new(sweep("L", 0.0, 200.0, 1.0))
            .with_detector("echo")
            .with_delay(0.01);
        jobs.spawn(Arc::clone(&engine), Box::new(plan)).unwrap();

        assert!(!jobs.wait_finished(1, Duration::from_millis(10)).await);
        assert!(jobs.is_running());
        assert!(logs_contain("background job not finished"));

        jobs.abort("test").await.unwrap();
        jobs.join().await.unwrap();
    }
}
