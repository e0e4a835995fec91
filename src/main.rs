//! CLI Entry Point for qdot_tuning
//!
//! Runs tuning routines against the simulated station described by the
//! configuration file:
//! - Pinch-off scan of a single gate
//! - 2D scan of two gates
//! - Listing gate values and boundaries
//!
//! # Usage
//!
//! ```bash
//! qdot_tuning pinchoff --gate L --full
//! qdot_tuning scan2d --step-gate L --step-range -100 -300 --sweep-gate R --sweep-range -100 -300
//! qdot_tuning --config config/qdot_tuning.toml gates
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use qdot_tuning::config::{TuningConfig, DEFAULT_CONFIG_PATH};
use qdot_tuning::dataset::dataset_2d_metadata;
use qdot_tuning::scanjob::{create_scan_job, MeasurementRef};
use qdot_tuning::scans::{scan_2d, scan_pinch_value, wait_time, PinchOptions, ScanOptions};
use qdot_tuning::station::Station;
use qdot_tuning::tracing_setup::{self, OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "qdot_tuning")]
#[command(about = "Gate sweeps and operating-point extraction for quantum dots", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pinch-off scan of a single gate
    Pinchoff {
        /// Gate to sweep
        #[arg(long)]
        gate: String,

        /// Use 2 mV instead of 6 mV steps
        #[arg(long)]
        full: bool,

        /// Reuse a stored scan when present
        #[arg(long)]
        cache: bool,

        /// Base value of the gate (mV)
        #[arg(long, allow_negative_numbers = true)]
        base: Option<f64>,

        /// Detector, a Keithley index or a detector name
        #[arg(long, default_value = "1")]
        instrument: String,
    },

    /// 2D scan stepping one gate and sweeping another
    Scan2d {
        /// Outer (stepped) gate
        #[arg(long)]
        step_gate: String,

        /// Start and end of the step gate (mV)
        #[arg(long, num_args = 2, allow_negative_numbers = true)]
        step_range: Vec<f64>,

        /// Inner (swept) gate
        #[arg(long)]
        sweep_gate: String,

        /// Start and end of the sweep gate (mV)
        #[arg(long, num_args = 2, allow_negative_numbers = true)]
        sweep_range: Vec<f64>,

        /// Step size (mV)
        #[arg(long, default_value_t = -4.0, allow_negative_numbers = true)]
        step: f64,

        /// Output file, defaults to the storage directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show gate values and boundaries
    Gates,
}

fn parse_measurement(value: &str) -> MeasurementRef {
    value
        .parse::<u32>()
        .map_or_else(|_| MeasurementRef::Name(value.to_string()), MeasurementRef::Index)
}

fn range_pair(values: &[f64], name: &str) -> Result<(f64, f64)> {
    match values {
        [start, end] => Ok((*start, *end)),
        _ => Err(anyhow!("{name} needs a start and an end value")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TuningConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    let level = TracingConfig::from_tuning_config(&config)
        .map_err(|e| anyhow!(e))?
        .level;
    tracing_setup::init(TracingConfig::new(level).with_format(cli.log_format))
        .map_err(|e| anyhow!(e))?;
    info!(name = %config.application.name, "qdot_tuning starting");

    let station = Station::from_config(&config)?;

    match cli.command {
        Commands::Pinchoff {
            gate,
            full,
            cache,
            base,
            instrument,
        } => {
            let options = PinchOptions {
                basevalues: base.map(|b| BTreeMap::from([(gate.clone(), b)])),
                instrument: vec![parse_measurement(&instrument)],
                cache,
                full,
                ..Default::default()
            };
            let dataset =
                scan_pinch_value(&station, &config.storage.output_dir, &gate, &options).await?;
            let adata = dataset
                .metadata
                .get("adata")
                .ok_or_else(|| anyhow!("pinch-off scan of {gate} has no analysis"))?;
            println!("{}", serde_json::to_string_pretty(adata)?);
        }

        Commands::Scan2d {
            step_gate,
            step_range,
            sweep_gate,
            sweep_range,
            step,
            output,
        } => {
            let job = create_scan_job(
                &step_gate,
                range_pair(&step_range, "--step-range")?,
                Some(&sweep_gate),
                Some(range_pair(&sweep_range, "--sweep-range")?),
                Some(step),
                None,
            );
            let output = output.unwrap_or_else(|| {
                config
                    .storage
                    .output_dir
                    .join(format!("scan2d-{step_gate}-{sweep_gate}.json"))
            });
            let options = ScanOptions::from_config(&config.scan)
                .with_wait_time(wait_time(&sweep_gate, Some(&station), None))
                .with_location(&output);
            let dataset = scan_2d(&station, &job, &options).await?;
            let meta = dataset_2d_metadata(&dataset, None)?;
            println!(
                "Scanned {} x {} points of {} into {}",
                meta.vstep.len(),
                meta.vsweep.len(),
                meta.arrayname,
                output.display()
            );
        }

        Commands::Gates => {
            let values = station.gates().all_values()?;
            let boundaries = station.gates().get_boundaries();
            for (gate, value) in values {
                match boundaries.get(&gate) {
                    Some(b) => println!("{gate:>8}: {value:9.2} mV  [{}, {}]", b.low(), b.high()),
                    None => println!("{gate:>8}: {value:9.2} mV"),
                }
            }
        }
    }

    Ok(())
}
