//! [`DriverFactory`] implementations for the mock devices.
//!
//! Config tables look like:
//!
//! ```toml
//! [[devices]]
//! id = "panda1"
//! driver = "mock_panda"
//! [devices.config]
//! mode = "realistic"
//! fail_operations = ["set:pcap.arm"]
//! ```

use super::common::{ErrorConfig, ErrorScenario, MockMode};
use super::manta::{MockManta, DEFAULT_RESOLUTION};
use super::motor::MockMotor;
use super::panda::{default_captures, MockPanda};
use super::sim::{Noise, PeakParams, SimDetector, SimMotor};
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tst_core::driver::{BuildContext, Capability, DeviceCategory, DeviceComponents, DriverFactory};

/// Options every mock device accepts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MockCommonConfig {
    /// Instant or realistic timing.
    pub mode: MockMode,
    /// Operation keys that always fail.
    pub fail_operations: Vec<String>,
    /// Random failure rate applied to every operation.
    pub failure_rate: f64,
    /// Seed for the failure rng.
    pub seed: Option<u64>,
}

impl MockCommonConfig {
    fn error_config(&self) -> ErrorConfig {
        if !self.fail_operations.is_empty() {
            return ErrorConfig::scenarios(
                self.fail_operations
                    .iter()
                    .map(|operation| ErrorScenario::Fail {
                        operation: operation.clone(),
                    })
                    .collect(),
            );
        }
        if self.failure_rate > 0.0 {
            return ErrorConfig::random_failures_seeded(self.failure_rate, self.seed);
        }
        ErrorConfig::none()
    }

    fn check(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            bail!("failure_rate must be within 0..=1, got {}", self.failure_rate);
        }
        Ok(())
    }
}

fn parse<T: for<'de> Deserialize<'de> + Default>(config: toml::Value) -> Result<T> {
    match config {
        toml::Value::Table(ref t) if t.is_empty() => Ok(T::default()),
        other => Ok(other.try_into()?),
    }
}

// =============================================================================
// Manta
// =============================================================================

/// Config for `mock_manta`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockMantaConfig {
    /// Sensor width.
    pub width: u32,
    /// Sensor height.
    pub height: u32,
    /// Shared mock options.
    #[serde(flatten)]
    pub common: MockCommonConfig,
}

impl Default for MockMantaConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_RESOLUTION.0,
            height: DEFAULT_RESOLUTION.1,
            common: MockCommonConfig::default(),
        }
    }
}

/// Builds [`MockManta`] devices.
pub struct MockMantaFactory;

static MANTA_CAPABILITIES: &[Capability] = &[
    Capability::Stageable,
    Capability::Preparable,
    Capability::Flyable,
    Capability::Collectable,
    Capability::Triggerable,
    Capability::Readable,
    Capability::CaptureCount,
    Capability::Hdf5Warmup,
    Capability::SignalTree,
    Capability::Connectable,
];

impl DriverFactory for MockMantaFactory {
    fn driver_type(&self) -> &'static str {
        "mock_manta"
    }

    fn name(&self) -> &'static str {
        "Mock Manta area detector"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MANTA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockMantaConfig = parse(config.clone())?;
        if cfg.width == 0 || cfg.height == 0 {
            bail!("mock_manta resolution must be non-zero, got {}x{}", cfg.width, cfg.height);
        }
        cfg.common.check()
    }

    fn build(
        &self,
        config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockMantaConfig = parse(config)?;
            let manta = Arc::new(MockManta::with_options(
                &ctx.id,
                ctx.path_provider,
                (cfg.width, cfg.height),
                cfg.common.mode,
                cfg.common.error_config(),
            ));
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Detector)
                .with_stageable(manta.clone())
                .with_preparable(manta.clone())
                .with_flyable(manta.clone())
                .with_collectable(manta.clone())
                .with_triggerable(manta.clone())
                .with_readable(manta.clone())
                .with_capture_count(manta.clone())
                .with_hdf5_warmup(manta.clone())
                .with_signals(manta.clone())
                .with_connectable(manta))
        })
    }
}

// =============================================================================
// PandA
// =============================================================================

/// Config for `mock_panda`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockPandaConfig {
    /// Capture selectors by path (`inenc1.val_capture = "Mean"`).
    pub captures: BTreeMap<String, String>,
    /// Shared mock options.
    #[serde(flatten)]
    pub common: MockCommonConfig,
}

impl Default for MockPandaConfig {
    fn default() -> Self {
        Self {
            captures: default_captures(),
            common: MockCommonConfig::default(),
        }
    }
}

/// Builds [`MockPanda`] devices.
pub struct MockPandaFactory;

static PANDA_CAPABILITIES: &[Capability] = &[
    Capability::Stageable,
    Capability::Preparable,
    Capability::Flyable,
    Capability::Collectable,
    Capability::Armable,
    Capability::CaptureChannels,
    Capability::SignalTree,
    Capability::Connectable,
];

impl DriverFactory for MockPandaFactory {
    fn driver_type(&self) -> &'static str {
        "mock_panda"
    }

    fn name(&self) -> &'static str {
        "Mock PandA trigger box"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PANDA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockPandaConfig = parse(config.clone())?;
        if let Some(bad) = cfg.captures.keys().find(|k| !k.ends_with("_capture")) {
            bail!("mock_panda capture selector '{}' must end with _capture", bad);
        }
        cfg.common.check()
    }

    fn build(
        &self,
        config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockPandaConfig = parse(config)?;
            let panda = Arc::new(MockPanda::with_options(
                &ctx.id,
                ctx.path_provider,
                cfg.captures,
                cfg.common.mode,
                cfg.common.error_config(),
            ));
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::TriggerBox)
                .with_stageable(panda.clone())
                .with_preparable(panda.clone())
                .with_flyable(panda.clone())
                .with_collectable(panda.clone())
                .with_trigger_box(panda.clone())
                .with_signals(panda.clone())
                .with_connectable(panda))
        })
    }
}

// =============================================================================
// Motors
// =============================================================================

/// Config for `mock_motor`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockMotorConfig {
    /// Engineering units.
    pub units: String,
    /// Shared mock options.
    #[serde(flatten)]
    pub common: MockCommonConfig,
}

impl Default for MockMotorConfig {
    fn default() -> Self {
        Self {
            units: "deg".to_string(),
            common: MockCommonConfig::default(),
        }
    }
}

/// Builds [`MockMotor`] devices.
pub struct MockMotorFactory;

static MOTOR_CAPABILITIES: &[Capability] = &[
    Capability::Movable,
    Capability::Readable,
    Capability::Stageable,
    Capability::Preparable,
    Capability::Flyable,
    Capability::SignalTree,
    Capability::Connectable,
];

impl DriverFactory for MockMotorFactory {
    fn driver_type(&self) -> &'static str {
        "mock_motor"
    }

    fn name(&self) -> &'static str {
        "Mock motor"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOTOR_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockMotorConfig = parse(config.clone())?;
        cfg.common.check()
    }

    fn build(
        &self,
        config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockMotorConfig = parse(config)?;
            let motor = Arc::new(MockMotor::with_options(
                &ctx.id,
                &cfg.units,
                cfg.common.mode,
                cfg.common.error_config(),
            ));
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Motor)
                .with_movable(motor.clone())
                .with_readable(motor.clone())
                .with_stageable(motor.clone())
                .with_preparable(motor.clone())
                .with_flyable(motor.clone())
                .with_signals(motor.clone())
                .with_connectable(motor))
        })
    }
}

/// Builds [`SimMotor`] devices. Takes no options.
pub struct SimMotorFactory;

impl DriverFactory for SimMotorFactory {
    fn driver_type(&self) -> &'static str {
        "sim_motor"
    }

    fn name(&self) -> &'static str {
        "Simulated motor"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Movable, Capability::Readable, Capability::SignalTree]
    }

    fn validate(&self, _config: &toml::Value) -> Result<()> {
        Ok(())
    }

    fn build(
        &self,
        _config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let motor = Arc::new(SimMotor::new(&ctx.id));
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Simulated)
                .with_movable(motor.clone())
                .with_readable(motor.clone())
                .with_signals(motor))
        })
    }
}

// =============================================================================
// Simulated detector
// =============================================================================

/// Config for `sim_detector`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimDetectorConfig {
    /// Id of the registered motor the peak is measured against.
    pub motor: String,
    /// Peak height.
    pub imax: f64,
    /// Peak center.
    pub center: f64,
    /// Peak width.
    pub sigma: f64,
    /// Noise model.
    pub noise: Noise,
    /// Uniform noise scale.
    pub noise_multiplier: f64,
    /// Noise rng seed.
    pub seed: Option<u64>,
}

impl Default for SimDetectorConfig {
    fn default() -> Self {
        let peak = PeakParams::default();
        Self {
            motor: "sim_motor".to_string(),
            imax: peak.imax,
            center: peak.center,
            sigma: peak.sigma,
            noise: peak.noise,
            noise_multiplier: peak.noise_multiplier,
            seed: None,
        }
    }
}

impl SimDetectorConfig {
    fn peak(&self) -> PeakParams {
        PeakParams {
            imax: self.imax,
            center: self.center,
            sigma: self.sigma,
            noise: self.noise,
            noise_multiplier: self.noise_multiplier,
        }
    }
}

/// Builds [`SimDetector`] devices over an already-registered motor.
pub struct SimDetectorFactory;

impl DriverFactory for SimDetectorFactory {
    fn driver_type(&self) -> &'static str {
        "sim_detector"
    }

    fn name(&self) -> &'static str {
        "Simulated Gaussian detector"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Readable, Capability::Triggerable, Capability::SignalTree]
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SimDetectorConfig = parse(config.clone())?;
        if cfg.sigma <= 0.0 {
            bail!("sim_detector sigma must be positive, got {}", cfg.sigma);
        }
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimDetectorConfig = parse(config)?;
            let motor = ctx
                .devices
                .as_ref()
                .and_then(|devices| devices.movable(&cfg.motor))
                .ok_or_else(|| {
                    anyhow!(
                        "sim_detector '{}' needs movable device '{}' registered first",
                        ctx.id,
                        cfg.motor
                    )
                })?;
            let detector = Arc::new(SimDetector::new(&ctx.id, motor, cfg.peak(), cfg.seed));
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Simulated)
                .with_triggerable(detector.clone())
                .with_readable(detector.clone())
                .with_signals(detector))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProposalPathProvider;

    fn ctx(id: &str) -> BuildContext {
        BuildContext::new(id, Arc::new(ProposalPathProvider::mock("tst")))
    }

    #[tokio::test]
    async fn test_manta_factory_builds_full_bag() {
        let components = MockMantaFactory
            .build(toml::Value::Table(Default::default()), ctx("manta1"))
            .await
            .unwrap();
        assert!(components.capture_count.is_some());
        assert!(components.hdf5_warmup.is_some());
        assert_eq!(components.category, Some(DeviceCategory::Detector));
    }

    #[test]
    fn test_panda_validate_rejects_bad_selector() {
        let config: toml::Value = toml::from_str(
            r#"
            [captures]
            "inenc1.val" = "Mean"
            "#,
        )
        .unwrap();
        assert!(MockPandaFactory.validate(&config).is_err());
    }

    #[test]
    fn test_common_options_parse() {
        let config: toml::Value = toml::from_str(
            r#"
            mode = "realistic"
            fail_operations = ["kickoff"]
            "#,
        )
        .unwrap();
        let cfg: MockMotorConfig = parse(config).unwrap();
        assert_eq!(cfg.common.mode, MockMode::Realistic);
        assert_eq!(cfg.common.fail_operations, vec!["kickoff"]);
        assert!(cfg.common.error_config().check_operation("mock_motor", "kickoff").is_err());
    }

    #[tokio::test]
    async fn test_sim_detector_requires_motor() {
        let result = SimDetectorFactory
            .build(toml::Value::Table(Default::default()), ctx("sim_det"))
            .await;
        assert!(result.is_err());
    }
}
