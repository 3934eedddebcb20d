//! X-ray absorption spectroscopy plans.
//!
//! [`XasDemo`] flies the rotation stage (standing in for the monochromator)
//! through an energy range while the PandA clocks frames. Timing for every
//! stream comes from a [`FlyerCoordinator`], which is prepared, kicked off
//! and completed around the device protocol and aborted if the acquisition
//! fails once running.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

use super::{merge_metadata, Plan, COUNTS_PER_DEG, RESTORE_VELOCITY};
use crate::flyers::{create_advanced_flyer_coordinator, FlyerCoordinator};
use crate::run_engine::{ExitStatus, RunContext};
use tst_core::error::{FlyError, FlyResult};
use tst_core::status::PollOutcome;
use tst_hardware::config::CoordinationConfig;

/// Clock reset time between frames (ms).
const RESET_TIME_MS: f64 = 0.001;
/// Run-up before the first point (deg).
const PRE_START_DEG: f64 = 5.0;
const COMPLETE_POLL: Duration = Duration::from_millis(500);

/// PandA clock and motion settings derived from an [`XasDemo`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XasTiming {
    /// Clock period (ms).
    pub clock_period_ms: f64,
    /// Clock pulse width (ms).
    pub clock_width_ms: f64,
    /// Stage speed during the scan (deg/s).
    pub target_velocity: f64,
    /// Position compare start (counts).
    pub start_cnt: i64,
    /// Position compare width (counts).
    pub width_cnt: i64,
}

/// Coordinated XAS fly scan.
#[derive(Debug, Clone)]
pub struct XasDemo {
    /// Points to acquire.
    pub npoints: u32,
    /// Scan duration (s).
    pub total_time: f64,
    /// First energy (used as a stage angle).
    pub start_e: f64,
    /// Last energy.
    pub end_e: f64,
    /// Camera device id, if a camera takes part.
    pub detector: Option<String>,
    /// Trigger box device id.
    pub panda: String,
    /// Stage device id.
    pub motor: String,
    /// Coordination policies.
    pub coordination: CoordinationConfig,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl XasDemo {
    /// Scan of `npoints` points from `start_e` to `end_e` in `total_time`
    /// seconds with `manta1` and `panda1`.
    pub fn new(npoints: u32, total_time: f64, start_e: f64, end_e: f64) -> Self {
        Self {
            npoints,
            total_time,
            start_e,
            end_e,
            detector: Some("manta1".to_string()),
            panda: "panda1".to_string(),
            motor: "rot_motor".to_string(),
            coordination: CoordinationConfig::default(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Use `detector`, or no camera at all.
    pub fn with_detector(mut self, detector: Option<&str>) -> Self {
        self.detector = detector.map(str::to_string);
        self
    }

    /// Use `config` for the coordinator and its flyers.
    pub fn with_coordination(mut self, config: CoordinationConfig) -> Self {
        self.coordination = config;
        self
    }

    /// Check the scan and derive clock and motion settings.
    pub fn timing(&self) -> FlyResult<XasTiming> {
        if self.npoints == 0 {
            return Err(FlyError::InvalidArgument("XAS scan needs at least 1 point".into()));
        }
        if !(self.total_time.is_finite() && self.total_time > 0.0) {
            return Err(FlyError::InvalidArgument(format!(
                "Total time must be positive, got {}",
                self.total_time
            )));
        }
        let width_deg = self.end_e - self.start_e;
        if width_deg == 0.0 {
            return Err(FlyError::InvalidArgument(
                "Start and end energy are identical".into(),
            ));
        }

        let clock_period_ms = self.total_time * 1000.0 / f64::from(self.npoints);
        Ok(XasTiming {
            clock_period_ms,
            clock_width_ms: clock_period_ms - RESET_TIME_MS,
            target_velocity: width_deg / self.total_time,
            start_cnt: (PRE_START_DEG * COUNTS_PER_DEG) as i64,
            width_cnt: (width_deg * COUNTS_PER_DEG) as i64,
        })
    }

    fn devices(&self) -> Vec<&str> {
        let mut devices = vec![self.panda.as_str()];
        devices.extend(self.detector.as_deref());
        devices
    }

    async fn configure_panda(&self, ctx: &RunContext, timing: &XasTiming) -> Result<()> {
        let panda = self.panda.as_str();
        ctx.set_signal(panda, "pcomp1.enable", "ZERO").await?;
        ctx.set_signal(panda, "pcomp1.start", timing.start_cnt).await?;
        ctx.set_signal(panda, "pcomp1.width", timing.width_cnt).await?;
        ctx.set_signal(panda, "clock1.period", timing.clock_period_ms).await?;
        ctx.set_signal(panda, "clock1.period_units", "ms").await?;
        ctx.set_signal(panda, "clock1.width", timing.clock_width_ms).await?;
        ctx.set_signal(panda, "clock1.width_units", "ms").await?;
        info!(
            period_ms = timing.clock_period_ms,
            width_ms = timing.clock_width_ms,
            "PandA clock configured"
        );
        Ok(())
    }

    async fn prepare_devices(
        &self,
        ctx: &mut RunContext,
        coordinator: &mut FlyerCoordinator,
    ) -> Result<()> {
        let report = coordinator.prepare_all(i64::from(self.npoints)).await?;
        for warning in &report.warnings {
            warn!(coordinator = %coordinator.name(), "{}", warning);
        }

        let infos = coordinator.trigger_infos();
        if let Some(detector) = &self.detector {
            let info = infos
                .get("manta_0")
                .copied()
                .ok_or_else(|| anyhow!("Coordinator has no timing for {}", detector))?;
            ctx.set_signal(detector, "hdf.num_capture", i64::from(self.npoints))
                .await?;
            ctx.prepare(detector, info.into(), "prepare_detector")?;
            ctx.wait_for("prepare_detector").await?;
            info!(device = %detector, "Detector prepared");
        }

        let info = infos
            .get("panda")
            .copied()
            .ok_or_else(|| anyhow!("Coordinator has no timing for {}", self.panda))?;
        ctx.prepare(&self.panda, info.into(), "prepare_panda")?;
        ctx.wait_for("prepare_panda").await?;
        info!(device = %self.panda, "PandA prepared");
        Ok(())
    }

    /// Wait for `group` while collecting `device` into its stream.
    async fn drain(&self, ctx: &mut RunContext, group: &str, device: &str) -> Result<()> {
        let stream = format!("{}_stream", device);
        loop {
            let outcome = ctx.wait(group, COMPLETE_POLL).await;
            ctx.declare_stream(&stream, &[device]).await?;
            ctx.collect(&stream, &[device]).await?;
            match outcome {
                PollOutcome::Done => return Ok(()),
                PollOutcome::Pending => ctx.checkpoint(group).await?,
                PollOutcome::Failed(message) => bail!("{} failed: {}", group, message),
            }
        }
    }

    /// Everything from kickoff to the close of the run.
    async fn acquire(
        &self,
        ctx: &mut RunContext,
        coordinator: &mut FlyerCoordinator,
    ) -> Result<()> {
        coordinator.kickoff_all().await?;
        ctx.kickoff_all(&self.devices()).await?;
        info!("Kickoff complete");

        ctx.set_signal(&self.panda, "pcomp1.enable", "ONE").await?;
        ctx.move_to(&self.motor, self.end_e + PRE_START_DEG).await?;

        ctx.complete(&self.panda, "complete_panda")?;
        if let Some(detector) = &self.detector {
            ctx.complete(detector, "complete_detector")?;
        }

        self.drain(ctx, "complete_panda", &self.panda).await?;
        ctx.unstage_all(&[self.panda.as_str()]).await?;
        ctx.set_signal(&self.panda, "pcomp1.enable", "ZERO").await?;
        info!("PandA file saving complete");

        if let Some(detector) = &self.detector {
            self.drain(ctx, "complete_detector", detector).await?;
            ctx.sleep(0.01).await?;
            info!(device = %detector, "Detector HDF5 saved");
        }

        coordinator.complete_all().await?;
        ctx.close_run(ExitStatus::Success)
    }
}

#[async_trait]
impl Plan for XasDemo {
    fn plan_type(&self) -> &str {
        "xas"
    }

    fn plan_name(&self) -> &str {
        "xas_demo"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let mut args = HashMap::from([
            ("npoints".to_string(), self.npoints.to_string()),
            ("total_time".to_string(), self.total_time.to_string()),
            ("start_e".to_string(), self.start_e.to_string()),
            ("end_e".to_string(), self.end_e.to_string()),
        ]);
        if let Some(detector) = &self.detector {
            args.insert("detector".to_string(), detector.clone());
        }
        args
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        let timing = self.timing()?;
        info!(
            points = self.npoints,
            start = self.start_e,
            end = self.end_e,
            "Starting XAS scan"
        );

        let detectors: Vec<&str> = self.detector.iter().map(String::as_str).collect();
        let mut coordinator = create_advanced_flyer_coordinator(
            ctx.registry(),
            &detectors,
            &self.panda,
            &self.coordination,
        )?;

        ctx.set_velocity(&self.motor, RESTORE_VELOCITY).await?;
        ctx.move_to(&self.motor, self.start_e - PRE_START_DEG).await?;
        ctx.set_velocity(&self.motor, timing.target_velocity.abs()).await?;
        self.configure_panda(ctx, &timing).await?;

        let md = json!({
            "scan_type": "xas",
            "title": "TST XAS Scan",
            "npoints": self.npoints,
            "total_time": self.total_time,
            "start_energy": self.start_e,
            "end_energy": self.end_e,
            "target_velocity": timing.target_velocity,
            "motors": [self.motor],
            "detectors": detectors,
        });
        ctx.open_run(merge_metadata(md, &self.metadata))?;
        ctx.stage_all(&self.devices()).await?;

        self.prepare_devices(ctx, &mut coordinator).await?;

        if let Err(e) = self.acquire(ctx, &mut coordinator).await {
            error!(error = %format!("{:#}", e), "XAS acquisition failed, aborting flyers");
            let report = coordinator.abort_all().await;
            if !report.is_clean() {
                warn!(failed = ?report.failed, "Some flyers could not be stopped");
            }
            return Err(e);
        }

        let panda_captured = ctx.read_signal(&self.panda, "data.num_captured").await?;
        info!(device = %self.panda, captured = %panda_captured, "PandA capture count");
        if let Some(detector) = &self.detector {
            let captured = ctx.read_signal(detector, "hdf.num_captured").await?;
            info!(device = %detector, captured = %captured, "Detector capture count");
            ctx.unstage_all(&[detector.as_str()]).await?;
        }

        ctx.set_velocity(&self.motor, RESTORE_VELOCITY).await?;
        info!("XAS scan completed");
        Ok(())
    }
}

/// Step the stage through calibration energies and read it back.
#[derive(Debug, Clone)]
pub struct EnergyCalibration {
    /// Energies to visit, in order.
    pub energy_points: Vec<f64>,
    /// Stage device id.
    pub motor: String,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EnergyCalibration {
    /// Calibration over `energy_points` on `rot_motor`.
    pub fn new(energy_points: Vec<f64>) -> Self {
        Self {
            energy_points,
            motor: "rot_motor".to_string(),
            metadata: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl Plan for EnergyCalibration {
    fn plan_type(&self) -> &str {
        "calibration"
    }

    fn plan_name(&self) -> &str {
        "energy_calibration"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("points".to_string(), self.energy_points.len().to_string()),
            ("motor".to_string(), self.motor.clone()),
        ])
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        info!(points = self.energy_points.len(), "Starting energy calibration");
        let md = json!({
            "scan_type": "calibration",
            "title": "TST XAS Scan",
            "energy_points": self.energy_points,
            "motors": [self.motor],
        });
        ctx.open_run(merge_metadata(md, &self.metadata))?;

        let total = self.energy_points.len();
        for (i, energy) in self.energy_points.iter().enumerate() {
            ctx.checkpoint("calibration").await?;
            info!(point = i + 1, total, energy, "Calibration point");
            ctx.move_to(&self.motor, *energy).await?;
            ctx.trigger_and_read("calibration", &[self.motor.as_str()]).await?;
        }

        ctx.close_run(ExitStatus::Success)?;
        info!("Energy calibration completed");
        Ok(())
    }
}
