//! CLI entry point for the TST instrument.
//!
//! Provides commands for:
//! - Listing the devices the instrument configuration builds
//! - Checking device connections and warming up HDF5 writers
//! - Running acquisition plans and logging the documents they emit
//!
//! # Usage
//!
//! ```bash
//! tst-daq devices --json
//! tst-daq check
//! tst-daq run tomo --num-images 21 --scan-time 9
//! tst-daq --config tst.toml run xas 100 10 0 90
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tst_core::document::Document;
use tst_experiment::plans::{
    EnergyCalibration, MantaDarkFlat, SimCount, SimPrint, SimRelScan, TomoDemo, XasDemo,
};
use tst_experiment::{ExitStatus, Plan, RunEngine};
use tst_hardware::diagnostics::{validate_device_connections, warmup_hdf5_plugins};
use tst_hardware::{DeviceRegistry, InstrumentConfig};

#[derive(Parser)]
#[command(name = "tst-daq")]
#[command(about = "Flyer coordination and acquisition plans for the TST beamline", long_about = None)]
struct Cli {
    /// Instrument configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices and their capabilities
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check device connections and warm up HDF5 writers
    Check,

    /// Run an acquisition plan
    #[command(subcommand)]
    Run(PlanCommand),
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Fly-scan tomography over half a turn
    Tomo {
        #[arg(long, default_value_t = 21)]
        num_images: u64,
        #[arg(long, default_value_t = 9.0)]
        scan_time: f64,
        #[arg(long, default_value_t = 0.0)]
        start_deg: f64,
        #[arg(long)]
        exposure_time: Option<f64>,
        /// Camera ids
        #[arg(long, default_values_t = vec!["manta1".to_string()])]
        detectors: Vec<String>,
    },

    /// Dark and flat field frames
    DarkFlat {
        #[arg(long, default_value_t = 10)]
        num_dark: u32,
        #[arg(long, default_value_t = 10)]
        num_flat: u32,
    },

    /// Coordinated XAS fly scan
    Xas {
        npoints: u32,
        total_time: f64,
        start_e: f64,
        end_e: f64,
        #[arg(long, default_value = "manta1", conflicts_with = "no_detector")]
        detector: String,
        /// Run with the PandA only
        #[arg(long)]
        no_detector: bool,
    },

    /// Step the stage through calibration energies
    EnergyCal {
        #[arg(required = true)]
        points: Vec<f64>,
        #[arg(long, default_value = "rot_motor")]
        motor: String,
    },

    /// Count the simulated detector
    Count {
        #[arg(long, default_value_t = 1)]
        num: u32,
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },

    /// Relative scan of the simulated motor
    RelScan {
        #[arg(long, default_value_t = -2.5, allow_hyphen_values = true)]
        start: f64,
        #[arg(long, default_value_t = 2.5)]
        stop: f64,
        #[arg(long, default_value_t = 11)]
        num: u32,
        /// none, uniform or poisson
        #[arg(long, default_value = "uniform")]
        noise: String,
    },

    /// Log a message and the simulator state
    Print {
        #[arg(default_value = "This is a test.")]
        message: String,
    },
}

impl PlanCommand {
    fn into_plan(self, config: &InstrumentConfig) -> Result<Box<dyn Plan>> {
        let plan: Box<dyn Plan> = match self {
            PlanCommand::Tomo {
                num_images,
                scan_time,
                start_deg,
                exposure_time,
                detectors,
            } => Box::new(TomoDemo {
                num_images,
                scan_time,
                start_deg,
                exposure_time,
                detectors,
                ..TomoDemo::default()
            }),
            PlanCommand::DarkFlat { num_dark, num_flat } => Box::new(MantaDarkFlat {
                num_dark,
                num_flat,
                ..MantaDarkFlat::default()
            }),
            PlanCommand::Xas {
                npoints,
                total_time,
                start_e,
                end_e,
                detector,
                no_detector,
            } => Box::new(
                XasDemo::new(npoints, total_time, start_e, end_e)
                    .with_detector((!no_detector).then_some(detector.as_str()))
                    .with_coordination(config.coordination.clone()),
            ),
            PlanCommand::EnergyCal { points, motor } => Box::new(EnergyCalibration {
                motor,
                ..EnergyCalibration::new(points)
            }),
            PlanCommand::Count { num, delay } => Box::new(SimCount {
                delay,
                ..SimCount::new(num)
            }),
            PlanCommand::RelScan {
                start,
                stop,
                num,
                noise,
            } => Box::new(SimRelScan {
                start,
                stop,
                num,
                noise: noise.parse()?,
                ..SimRelScan::default()
            }),
            PlanCommand::Print { message } => Box::new(SimPrint { message }),
        };
        Ok(plan)
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = InstrumentConfig::load(cli.config.as_deref())?;
    let registry = Arc::new(DeviceRegistry::from_config(&config).await?);
    info!(devices = registry.len(), mock_mode = config.mock_mode, "Instrument ready");

    match cli.command {
        Commands::Devices { json } => list_devices(&registry, json),
        Commands::Check => check_devices(&registry).await,
        Commands::Run(command) => {
            let plan = command.into_plan(&config)?;
            run_plan(registry, plan).await
        }
    }
}

fn list_devices(registry: &DeviceRegistry, json: bool) -> Result<()> {
    let mut devices = registry.list_devices();
    devices.sort_by(|a, b| a.id.cmp(&b.id));

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    println!("{:<12} {:<14} {:<24} CAPABILITIES", "ID", "DRIVER", "NAME");
    for device in devices {
        let capabilities: Vec<String> = device
            .capabilities
            .iter()
            .map(|c| format!("{:?}", c))
            .collect();
        println!(
            "{:<12} {:<14} {:<24} {}",
            device.id,
            device.driver_type,
            device.name,
            capabilities.join(", ")
        );
    }
    Ok(())
}

async fn check_devices(registry: &DeviceRegistry) -> Result<()> {
    let connections = validate_device_connections(registry).await;
    for id in &connections.disconnected {
        warn!(device = %id, "Device not connected");
    }
    for error in &connections.errors {
        warn!(error = %error, "Connection check failed");
    }
    info!(
        connected = connections.connected.len(),
        disconnected = connections.disconnected.len(),
        "Connection check complete"
    );

    let warmup = warmup_hdf5_plugins(registry).await;
    info!(
        warmed = ?warmup.warmed,
        skipped = ?warmup.skipped,
        failed = ?warmup.failed,
        "HDF5 warm-up complete"
    );

    if !connections.all_connected() || !warmup.failed.is_empty() {
        bail!("Instrument check failed");
    }
    Ok(())
}

async fn run_plan(registry: Arc<DeviceRegistry>, plan: Box<dyn Plan>) -> Result<()> {
    let engine = Arc::new(RunEngine::new(registry));

    let mut docs = engine.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(doc) = docs.recv().await {
            log_document(&doc);
        }
    });

    engine.queue(plan).await;

    let runner = engine.clone();
    let mut run = tokio::spawn(async move { runner.start().await });
    let outcome = tokio::select! {
        joined = &mut run => joined??,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, aborting plan");
            engine.abort("interrupted by operator").await?;
            run.await??
        }
    };

    drop(engine);
    logger.abort();

    match &outcome.status {
        ExitStatus::Success => {
            info!(plan = %outcome.plan_name, runs = ?outcome.run_uids, "Plan succeeded");
            Ok(())
        }
        status => bail!("Plan {} ended with {}", outcome.plan_name, status),
    }
}

fn log_document(doc: &Document) {
    match doc {
        Document::Start(start) => {
            info!(run_uid = %start.uid, plan = %start.plan_name, "Run started")
        }
        Document::Descriptor(desc) => {
            info!(stream = %desc.name, keys = desc.data_keys.len(), "Stream declared")
        }
        Document::Event(event) => {
            info!(seq_num = event.seq_num, data = ?event.data, "Event")
        }
        Document::StreamResource(resource) => {
            info!(data_key = %resource.data_key, uri = %resource.uri.display(), "Stream resource")
        }
        Document::Stop(stop) => {
            info!(
                run_uid = %stop.run_uid,
                exit_status = %stop.exit_status,
                events = ?stop.num_events,
                "Run stopped"
            )
        }
    }
}
