//! Simulator plans, for development and testing only.
//!
//! They drive `sim_det`, a Gaussian-peak detector reading the position of
//! `sim_motor`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{merge_metadata, Plan};
use crate::run_engine::{ExitStatus, RunContext};
use tst_hardware::drivers::mock::Noise;

const DETECTOR: &str = "sim_det";
const MOTOR: &str = "sim_motor";

const TITLE: &str = "test run with simulator(s)";

/// Count the simulated detector `num` times.
#[derive(Debug, Clone)]
pub struct SimCount {
    /// Readings to take.
    pub num: u32,
    /// Pause between readings (s).
    pub delay: f64,
    /// Peak height.
    pub imax: f64,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SimCount {
    /// `num` readings without delay.
    pub fn new(num: u32) -> Self {
        Self {
            num,
            delay: 0.0,
            imax: 10_000.0,
            metadata: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl Plan for SimCount {
    fn plan_type(&self) -> &str {
        "count"
    }

    fn plan_name(&self) -> &str {
        "sim_count"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("num".to_string(), self.num.to_string()),
            ("delay".to_string(), self.delay.to_string()),
        ])
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        debug!(num = self.num, "sim_count");
        ctx.set_signal(DETECTOR, "imax", self.imax).await?;

        let md = json!({"title": TITLE, "detectors": [DETECTOR], "num_points": self.num});
        ctx.open_run(merge_metadata(md, &self.metadata))?;
        for i in 0..self.num {
            ctx.checkpoint("count").await?;
            ctx.trigger_and_read("primary", &[DETECTOR]).await?;
            if self.delay > 0.0 && i + 1 < self.num {
                ctx.sleep(self.delay).await?;
            }
        }
        ctx.close_run(ExitStatus::Success)
    }
}

/// Log a message and the simulator state. Opens no run.
#[derive(Debug, Clone)]
pub struct SimPrint {
    /// Message to log.
    pub message: String,
}

impl Default for SimPrint {
    fn default() -> Self {
        Self {
            message: "This is a test.".to_string(),
        }
    }
}

#[async_trait]
impl Plan for SimPrint {
    fn plan_type(&self) -> &str {
        "print"
    }

    fn plan_name(&self) -> &str {
        "sim_print"
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        info!(message = %self.message, "sim_print");
        let registry = ctx.registry();
        match (registry.get_movable(MOTOR), registry.get_readable(DETECTOR)) {
            (Some(motor), Some(detector)) => {
                let position = motor.position().await?;
                let reading = detector.read().await?;
                info!(position, reading = ?reading, "Simulator state");
            }
            _ => info!("Simulator devices not found"),
        }
        Ok(())
    }
}

/// Scan the simulated motor relative to its current position.
#[derive(Debug, Clone)]
pub struct SimRelScan {
    /// First offset.
    pub start: f64,
    /// Last offset.
    pub stop: f64,
    /// Points, both ends included.
    pub num: u32,
    /// Peak height.
    pub imax: f64,
    /// Peak position.
    pub center: f64,
    /// Peak width.
    pub sigma: f64,
    /// Noise model.
    pub noise: Noise,
    /// Extra start-document metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for SimRelScan {
    fn default() -> Self {
        Self {
            start: -2.5,
            stop: 2.5,
            num: 11,
            imax: 10_000.0,
            center: 0.0,
            sigma: 1.0,
            noise: Noise::Uniform,
            metadata: serde_json::Map::new(),
        }
    }
}

impl SimRelScan {
    /// Offsets from the starting position, evenly spaced.
    pub fn offsets(&self) -> Vec<f64> {
        match self.num {
            0 => Vec::new(),
            1 => vec![self.start],
            n => {
                let step = (self.stop - self.start) / f64::from(n - 1);
                (0..n).map(|i| self.start + step * f64::from(i)).collect()
            }
        }
    }
}

#[async_trait]
impl Plan for SimRelScan {
    fn plan_type(&self) -> &str {
        "rel_scan"
    }

    fn plan_name(&self) -> &str {
        "sim_rel_scan"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::from([
            ("start".to_string(), self.start.to_string()),
            ("stop".to_string(), self.stop.to_string()),
            ("num".to_string(), self.num.to_string()),
            ("noise".to_string(), self.noise.as_str().to_string()),
        ])
    }

    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        if self.num == 0 {
            bail!("rel_scan needs at least one point");
        }
        ctx.set_signal(DETECTOR, "imax", self.imax).await?;
        ctx.set_signal(DETECTOR, "center", self.center).await?;
        ctx.set_signal(DETECTOR, "sigma", self.sigma).await?;
        ctx.set_signal(DETECTOR, "noise", self.noise.as_str()).await?;

        let origin = ctx.position(MOTOR).await?;
        info!(position = origin, "sim_rel_scan");

        let md = json!({
            "title": TITLE,
            "detectors": [DETECTOR],
            "motors": [MOTOR],
            "num_points": self.num,
        });
        ctx.open_run(merge_metadata(md, &self.metadata))?;

        let scan = async {
            for offset in self.offsets() {
                ctx.checkpoint("rel_scan").await?;
                ctx.move_to(MOTOR, origin + offset).await?;
                ctx.trigger_and_read("primary", &[DETECTOR, MOTOR]).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        // A relative scan always returns the motor, even when it fails.
        ctx.move_to(MOTOR, origin).await?;
        scan?;
        ctx.close_run(ExitStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_include_both_ends() {
        let offsets = SimRelScan::default().offsets();
        assert_eq!(offsets.len(), 11);
        assert!((offsets[0] + 2.5).abs() < 1e-12);
        assert!((offsets[10] - 2.5).abs() < 1e-12);
        assert!((offsets[5]).abs() < 1e-12);
    }

    #[test]
    fn test_single_point() {
        let scan = SimRelScan {
            num: 1,
            ..SimRelScan::default()
        };
        assert_eq!(scan.offsets(), vec![-2.5]);
    }
}
