//! chip_daq - command line entry point
//!
//! Thin front end over the library: it loads the configuration, sets up logging and wires
//! the instrument session, temperature sensor and store together.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use chip_daq::chip::registry;
use chip_daq::config::AcquisitionConfig;
use chip_daq::data::{export_csv, reconcile, MeasurementStore, MemoryStore};
use chip_daq::instrument::{CommandChannel, InstrumentSession, SimulatedSmu};
use chip_daq::logging::{self, LoggingOptions};
use chip_daq::measurement::cv::CvAcquisition;
use chip_daq::measurement::iv::{sensor_from_config, ChipRequest, IvAcquisition};
use chip_daq::measurement::{ConsoleOperator, RunMode};

/// Command-line arguments for chip_daq
#[derive(Parser, Debug)]
#[command(name = "chip_daq")]
#[command(about = "IV and CV acquisition and reconciliation for semiconductor test chips")]
#[command(version)]
struct Args {
    /// Acquisition configuration (TOML or YAML)
    #[arg(short, long, global = true, env = "CHIPDAQ_CONFIG")]
    config: Option<PathBuf>,

    /// Use a simulated instrument and temperature sensor
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure IV data of the current chips
    Iv {
        /// Chip name; repeat for multi-chip configurations
        #[arg(short = 'n', long = "chip-name", required = true)]
        chip_names: Vec<String>,

        /// Wafer name
        #[arg(short, long)]
        wafer: String,

        /// Chip state identifier
        #[arg(short = 's', long)]
        chip_state: u64,

        /// Automatic measurement mode. Invalid measurements are skipped.
        #[arg(long)]
        auto: bool,

        /// Write the reconciled series of the measured chips to this CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Samples per simulated sweep
        #[arg(long, default_value_t = 11)]
        points: usize,
    },
    /// Measure CV data of the current chips
    Cv {
        /// Chip name; repeat for multi-chip configurations
        #[arg(short = 'n', long = "chip-name", required = true)]
        chip_names: Vec<String>,

        /// Wafer name
        #[arg(short, long)]
        wafer: String,

        /// Chip state identifier
        #[arg(short = 's', long)]
        chip_state: u64,

        /// Automatic measurement mode. Invalid measurements are skipped.
        #[arg(long)]
        auto: bool,

        /// Samples per simulated sweep
        #[arg(long, default_value_t = 11)]
        points: usize,
    },
    /// Print the type and geometry of a chip name
    Classify { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Classify { name } => {
            logging::init(&LoggingOptions::default());
            classify(&name)
        }
        Command::Iv {
            chip_names,
            wafer,
            chip_state,
            auto,
            output,
            points,
        } => {
            let config = load_config(args.config)?;
            let request = ChipRequest {
                chip_names,
                wafer,
                chip_state_id: chip_state,
            };
            measure_iv(&config, request, run_mode(auto), args.simulate, points, output).await
        }
        Command::Cv {
            chip_names,
            wafer,
            chip_state,
            auto,
            points,
        } => {
            let config = load_config(args.config)?;
            let request = ChipRequest {
                chip_names,
                wafer,
                chip_state_id: chip_state,
            };
            measure_cv(&config, request, run_mode(auto), args.simulate, points).await
        }
    }
}

/// Load the configuration and start logging as it asks.
fn load_config(path: Option<PathBuf>) -> Result<AcquisitionConfig> {
    let path = path.context("--config is required for measurements")?;
    let config = AcquisitionConfig::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init(&LoggingOptions::from(&config.application));
    info!(config = %path.display(), kind = %config.kind, "Starting {}", config.application.name);
    Ok(config)
}

fn run_mode(auto: bool) -> RunMode {
    if auto {
        RunMode::Automatic
    } else {
        RunMode::Interactive
    }
}

fn classify(name: &str) -> Result<()> {
    let code = registry().classify(name)?;
    let descriptor = registry().get(code.as_str())?;
    println!("type:      {code}");
    println!("family:    {:?}", descriptor.family);
    match registry().geometry_of(code.as_str()) {
        Ok(size) => {
            println!("size:      {} x {} mm", size.width, size.height);
            println!("area:      {} mm2", size.area());
            println!("perimeter: {} mm", size.perimeter());
        }
        Err(err) => println!("size:      {err}"),
    }
    match registry().coordinates(code.as_str(), name) {
        Ok(coordinates) => println!("x, y:      {}, {}", coordinates.x, coordinates.y),
        Err(err) => println!("x, y:      {err}"),
    }
    Ok(())
}

fn open_channel(config: &AcquisitionConfig, simulate: bool, points: usize) -> Result<Box<dyn CommandChannel>> {
    let instrument = &config.instrument;
    if simulate {
        return Ok(Box::new(SimulatedSmu::new(instrument.resource.clone(), points)));
    }
    #[cfg(feature = "instrument_visa")]
    {
        Ok(Box::new(
            chip_daq::instrument::VisaChannel::new(instrument.resource.clone())
                .with_timeout(instrument.timeout),
        ))
    }
    #[cfg(not(feature = "instrument_visa"))]
    {
        Err(chip_daq::DaqError::FeatureNotEnabled(format!(
            "instrument_visa (needed for {}; use --simulate otherwise)",
            instrument.resource
        ))
        .into())
    }
}

async fn measure_iv(
    config: &AcquisitionConfig,
    request: ChipRequest,
    mode: RunMode,
    simulate: bool,
    points: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let channel = open_channel(config, simulate, points)?;
    let mut session = InstrumentSession::new(config.instrument.name.clone(), channel)
        .with_error_queue(config.instrument.error_queue.resolve()?);
    let mut sensor = sensor_from_config(&config.temperature, simulate)?;
    let mut store = MemoryStore::new();
    let operator = ConsoleOperator;

    let report = IvAcquisition::new(config, mode, &operator)
        .run(&mut session, sensor.as_mut(), &mut store, &request)
        .await?;

    for skipped in &report.skipped {
        println!("Skipped {}: {}", skipped.name, skipped.reason);
    }
    println!(
        "Saved {} conditions groups for {} chips at {:.2} °C",
        report.committed.len(),
        report.chips.len(),
        report.temperature
    );

    if let Some(path) = output {
        let groups: Vec<_> = report
            .chips
            .iter()
            .flat_map(|chip| store.conditions(chip.id))
            .collect();
        let rows = reconcile(&groups);
        export_csv(&path, &rows, |id| {
            store.chip(id).map(|chip| chip.name).unwrap_or_default()
        })?;
        println!("Wrote {} rows to {}", rows.len(), path.display());
    }
    Ok(())
}

async fn measure_cv(
    config: &AcquisitionConfig,
    request: ChipRequest,
    mode: RunMode,
    simulate: bool,
    points: usize,
) -> Result<()> {
    let channel = open_channel(config, simulate, points)?;
    let mut session = InstrumentSession::new(config.instrument.name.clone(), channel)
        .with_error_queue(config.instrument.error_queue.resolve()?);
    let mut store = MemoryStore::new();
    let operator = ConsoleOperator;

    let report = CvAcquisition::new(config, mode, &operator)
        .run(&mut session, &mut store, &request)
        .await?;

    for skipped in &report.skipped {
        println!("Skipped {}: {}", skipped.name, skipped.reason);
    }
    println!(
        "Saved {} CV samples for {} chips",
        report.committed.len(),
        report.chips.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_path_from_environment() {
        std::env::set_var("CHIPDAQ_CONFIG", "config/lcr_cv.toml");
        let parsed = Args::try_parse_from(["chip_daq", "--simulate", "classify", "A0101"]);
        std::env::remove_var("CHIPDAQ_CONFIG");
        let args = parsed.unwrap();
        assert_eq!(args.config, Some(PathBuf::from("config/lcr_cv.toml")));
        assert!(args.simulate);
    }
}
