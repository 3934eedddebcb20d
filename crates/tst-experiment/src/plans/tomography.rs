//! Tomography plans for the rotation stage, PandA and Manta cameras.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{merge_metadata, Plan, COUNTS_PER_DEG, COUNTS_PER_REVOLUTION, DEG_PER_REVOLUTION, RESTORE_VELOCITY};
use crate::run_engine::{ExitStatus, RunContext};
use tst_core::error::{FlyError, FlyResult};
use tst_core::trigger::{DetectorTrigger, FlyMotorInfo, TriggerInfo};

/// Deadtime between camera frames (s).
const FRAME_DEADTIME: f64 = 0.001;
/// Ramp distance on either side of the half turn (deg).
const RAMP_DEG: f64 = 5.0;
const FLUSH_PERIOD: Duration = Duration::from_millis(250);
const STREAM: &str = "tomo_stream";

/// Encoder and exposure settings derived from a [`TomoDemo`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TomoTiming {
    /// Encoder counts between two pulses.
    pub step_width_counts: f64,
    /// Time between two frames (s).
    pub step_time: f64,
    /// Exposure per frame (s).
    pub exposure_time: f64,
    /// Encoder counts the stage travels during one exposure.
    pub width_in_counts: f64,
    /// Encoder position of the first pulse.
    pub start_encoder: i64,
}

/// Fly-scan tomography over half a turn of the rotation stage.
///
/// The PandA position compare block emits one pulse per projection; the
/// cameras are edge triggered and the PandA captures with a constant gate.
#[derive(Debug, Clone)]
pub struct TomoDemo {
    /// Projections over 180 degrees.
    pub num_images: u64,
    /// Duration of the half turn (s).
    pub scan_time: f64,
    /// Angle of the first projection (deg).
    pub start_deg: f64,
    /// Exposure per frame; a third of the step time when unset.
    pub exposure_time: Option<f64>,
    /// Camera device ids.
    pub detectors: Vec<String>,
    /// Trigger box device id.
    pub panda: String,
    /// Rotation stage device id.
    pub motor: String,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for TomoDemo {
    fn default() -> Self {
        Self {
            num_images: 21,
            scan_time: 9.0,
            start_deg: 0.0,
            exposure_time: None,
            detectors: vec!["manta1".to_string()],
            panda: "panda1".to_string(),
            motor: "rot_motor".to_string(),
            metadata: serde_json::Map::new(),
        }
    }
}

impl TomoDemo {
    /// Check the geometry and derive encoder and exposure settings.
    pub fn timing(&self) -> FlyResult<TomoTiming> {
        if self.num_images < 2 {
            return Err(FlyError::InvalidArgument(format!(
                "Tomography needs at least 2 images, got {}",
                self.num_images
            )));
        }
        if !(self.scan_time.is_finite() && self.scan_time > 0.0) {
            return Err(FlyError::InvalidArgument(format!(
                "Scan time must be positive, got {}",
                self.scan_time
            )));
        }

        let step_width_counts = COUNTS_PER_REVOLUTION / (2.0 * (self.num_images - 1) as f64);
        let rounded = (step_width_counts * 1e5).round() / 1e5;
        if step_width_counts.trunc() != rounded {
            return Err(FlyError::InvalidArgument(format!(
                "The number of encoder counts per pulse is not an integer value ({})",
                step_width_counts
            )));
        }

        let step_time = self.scan_time / self.num_images as f64;
        let exposure_time = match self.exposure_time {
            Some(exposure) if exposure > step_time => {
                return Err(FlyError::InvalidArgument(format!(
                    "Exposure time {}s is longer than the step time {}s",
                    exposure, step_time
                )));
            }
            Some(exposure) => exposure,
            None => step_time / 3.0,
        };

        let width_in_counts = (180.0 / self.scan_time) * COUNTS_PER_DEG * exposure_time;
        if width_in_counts > step_width_counts {
            return Err(FlyError::InvalidArgument(format!(
                "Exposure time {}s is too long: width {} counts exceeds step {} counts",
                exposure_time, width_in_counts, step_width_counts
            )));
        }

        Ok(TomoTiming {
            step_width_counts,
            step_time,
            exposure_time,
            width_in_counts,
            start_encoder: (self.start_deg * COUNTS_PER_DEG) as i64,
        })
    }

    fn detector_refs(&self) -> Vec<&str> {
        self.detectors.iter().map(String::as_str).collect()
    }
}

#[async_trait]
impl Plan for TomoDemo {
    fn plan_type(&self) -> &str {
        "tomography"
    }

    fn plan_name(&self) -> &str {
        "tomo_demo"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("num_images".to_string(), self.num_images.to_string()),
            ("scan_time".to_string(), self.scan_time.to_string()),
            ("start_deg".to_string(), self.start_deg.to_string()),
        ])
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        let timing = self.timing()?;
        info!(
            images = self.num_images,
            scan_time = self.scan_time,
            width_counts = timing.width_in_counts,
            "Starting tomography scan"
        );

        let detectors = self.detector_refs();
        let mut all_detectors = detectors.clone();
        all_detectors.push(self.panda.as_str());
        let mut all_devices = all_detectors.clone();
        all_devices.push(self.motor.as_str());

        let det_info = TriggerInfo::new(
            self.num_images,
            DetectorTrigger::EdgeTrigger,
            FRAME_DEADTIME,
            timing.exposure_time,
        );
        let panda_info = TriggerInfo::new(
            self.num_images,
            DetectorTrigger::ConstantGate,
            FRAME_DEADTIME,
            timing.exposure_time,
        );
        let motor_info = FlyMotorInfo {
            start_position: self.start_deg - RAMP_DEG,
            end_position: self.start_deg + DEG_PER_REVOLUTION / 2.0 + RAMP_DEG,
            time_for_move: self.scan_time,
        };

        let panda = self.panda.as_str();
        ctx.set_signal(panda, "pcomp1.start", timing.start_encoder).await?;
        ctx.set_signal(panda, "pcomp1.step", timing.step_width_counts as i64).await?;
        ctx.set_signal(panda, "pcomp1.pulses", self.num_images as i64).await?;

        let md = json!({
            "scan_type": "tomography",
            "title": "TST Tomography Scan",
            "num_images": self.num_images,
            "scan_time": self.scan_time,
            "start_deg": self.start_deg,
            "exposure_time": timing.exposure_time,
            "detectors": detectors,
            "motors": [self.motor],
        });
        ctx.open_run(merge_metadata(md, &self.metadata))?;
        ctx.stage_all(&all_devices).await?;

        for detector in &detectors {
            ctx.prepare(detector, det_info.into(), "prepare_all")?;
        }
        ctx.prepare(panda, panda_info.into(), "prepare_all")?;
        ctx.prepare(&self.motor, motor_info.into(), "prepare_all")?;
        ctx.wait_for("prepare_all").await?;
        ctx.checkpoint("prepared").await?;

        ctx.kickoff_all(&all_devices).await?;
        ctx.declare_stream(STREAM, &all_detectors).await?;
        ctx.collect_while_completing(&all_devices, &all_detectors, STREAM, FLUSH_PERIOD)
            .await?;

        ctx.unstage_all(&all_devices).await?;
        ctx.close_run(ExitStatus::Success)?;

        let panda_captured = ctx.read_signal(panda, "data.num_captured").await?;
        info!(device = %panda, captured = %panda_captured, "PandA capture count");
        for detector in &detectors {
            let captured = ctx.read_signal(detector, "hdf.num_captured").await?;
            info!(device = %detector, captured = %captured, "Detector capture count");
        }

        ctx.set_velocity(&self.motor, RESTORE_VELOCITY).await?;
        info!("Tomography scan completed");
        Ok(())
    }
}

/// Dark and flat field frames for tomography reconstruction.
#[derive(Debug, Clone)]
pub struct MantaDarkFlat {
    /// Camera device ids.
    pub detectors: Vec<String>,
    /// Dark frames (beam blocked).
    pub num_dark: u32,
    /// Flat frames (beam open, no sample).
    pub num_flat: u32,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for MantaDarkFlat {
    fn default() -> Self {
        Self {
            detectors: vec!["manta1".to_string()],
            num_dark: 10,
            num_flat: 10,
            metadata: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl Plan for MantaDarkFlat {
    fn plan_type(&self) -> &str {
        "calibration"
    }

    fn plan_name(&self) -> &str {
        "manta_collect_dark_flat"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("num_dark".to_string(), self.num_dark.to_string()),
            ("num_flat".to_string(), self.num_flat.to_string()),
        ])
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        info!(dark = self.num_dark, flat = self.num_flat, "Collecting dark and flat images");
        let detectors: Vec<&str> = self.detectors.iter().map(String::as_str).collect();

        let md = json!({
            "scan_type": "calibration",
            "title": "TST Tomography Scan",
            "num_dark": self.num_dark,
            "num_flat": self.num_flat,
            "detectors": detectors,
        });
        ctx.open_run(merge_metadata(md, &self.metadata))?;

        // TODO: close the shutter once one is on the instrument.
        for _ in 0..self.num_dark {
            ctx.checkpoint("dark").await?;
            ctx.trigger_and_read("dark", &detectors).await?;
        }
        for _ in 0..self.num_flat {
            ctx.checkpoint("flat").await?;
            ctx.trigger_and_read("flat", &detectors).await?;
        }

        ctx.close_run(ExitStatus::Success)?;
        info!("Dark and flat collection completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let timing = TomoDemo::default().timing().unwrap();
        assert_eq!(timing.step_width_counts, 200.0);
        assert!((timing.step_time - 9.0 / 21.0).abs() < 1e-12);
        assert!((timing.exposure_time - timing.step_time / 3.0).abs() < 1e-12);
        assert!(timing.width_in_counts < timing.step_width_counts);
        assert_eq!(timing.start_encoder, 0);
    }

    #[test]
    fn test_non_integral_step_rejected() {
        let plan = TomoDemo {
            num_images: 8,
            ..TomoDemo::default()
        };
        let err = plan.timing().unwrap_err();
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn test_single_image_rejected() {
        let plan = TomoDemo {
            num_images: 1,
            ..TomoDemo::default()
        };
        assert!(matches!(plan.timing(), Err(FlyError::InvalidArgument(_))));
    }

    #[test]
    fn test_exposure_longer_than_step_rejected() {
        let plan = TomoDemo {
            exposure_time: Some(1.0),
            ..TomoDemo::default()
        };
        assert!(plan.timing().unwrap_err().to_string().contains("longer than the step"));
    }

    #[test]
    fn test_exposure_up_to_step_time_fits() {
        let plan = TomoDemo {
            exposure_time: Some(9.0 / 21.0),
            ..TomoDemo::default()
        };
        let timing = plan.timing().unwrap();
        assert!(timing.width_in_counts <= timing.step_width_counts);
    }

    #[test]
    fn test_start_encoder_truncates() {
        let plan = TomoDemo {
            start_deg: 10.0,
            ..TomoDemo::default()
        };
        assert_eq!(plan.timing().unwrap().start_encoder, 222);
    }
}
