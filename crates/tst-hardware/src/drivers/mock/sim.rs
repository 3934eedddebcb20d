//! Simulated motor and Gaussian-peak detector for exercising step plans.

use super::common::{ErrorConfig, MockRng};
use super::signal::SignalMap;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tst_core::capabilities::{Movable, Readable, Signal, SignalTree, Triggerable};
use tst_core::document::DataKey;

/// Noise model of the simulated detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Noise {
    /// Exact Gaussian.
    #[default]
    None,
    /// Counting statistics.
    Poisson,
    /// Additive uniform noise scaled by the noise multiplier.
    Uniform,
}

impl Noise {
    /// Lowercase tag, as accepted by `FromStr`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Noise::None => "none",
            Noise::Poisson => "poisson",
            Noise::Uniform => "uniform",
        }
    }
}

impl std::str::FromStr for Noise {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Noise::None),
            "poisson" => Ok(Noise::Poisson),
            "uniform" => Ok(Noise::Uniform),
            other => bail!("unknown noise model '{}' (expected none, poisson or uniform)", other),
        }
    }
}

/// Simulated motor: moves instantly, reads back its setpoint.
pub struct SimMotor {
    id: String,
    signals: SignalMap,
}

impl SimMotor {
    /// Motor at position 0.
    pub fn new(id: &str) -> Self {
        let mut signals = SignalMap::new(id, "sim_motor", ErrorConfig::none());
        signals.add("user_readback", 0.0);
        signals.add("velocity", 1.0);
        Self {
            id: id.to_string(),
            signals,
        }
    }

    fn current(&self) -> f64 {
        self.signals
            .peek("user_readback")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }
}

impl SignalTree for SimMotor {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.signal(path)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.signal_paths()
    }
}

#[async_trait]
impl Movable for SimMotor {
    async fn move_abs(&self, position: f64) -> Result<()> {
        self.signals.poke("user_readback", position);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current())
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.signals.poke("velocity", velocity);
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self
            .signals
            .peek("velocity")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0))
    }
}

#[async_trait]
impl Readable for SimMotor {
    async fn read(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut values = serde_json::Map::new();
        values.insert(self.id.clone(), serde_json::json!(self.current()));
        Ok(values)
    }

    async fn describe(&self) -> Result<Vec<(String, DataKey)>> {
        Ok(vec![(self.id.clone(), DataKey::scalar(&self.id, "mm"))])
    }
}

/// Peak parameters of the simulated detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakParams {
    /// Peak height.
    pub imax: f64,
    /// Peak position on the motor axis.
    pub center: f64,
    /// Peak width.
    pub sigma: f64,
    /// Noise model.
    pub noise: Noise,
    /// Scale of uniform noise.
    pub noise_multiplier: f64,
}

impl Default for PeakParams {
    fn default() -> Self {
        Self {
            imax: 10_000.0,
            center: 0.0,
            sigma: 1.0,
            noise: Noise::None,
            noise_multiplier: 1.0,
        }
    }
}

/// Gaussian-peak detector whose intensity depends on a motor position.
///
/// The peak parameters are signals (`imax`, `center`, `sigma`, `noise`,
/// `noise_multiplier`) so plans can retune the peak between runs.
pub struct SimDetector {
    id: String,
    motor: Arc<dyn Movable>,
    signals: SignalMap,
    value: RwLock<f64>,
    rng: MockRng,
}

impl SimDetector {
    /// Detector over `motor` with the given peak.
    pub fn new(id: &str, motor: Arc<dyn Movable>, params: PeakParams, seed: Option<u64>) -> Self {
        let mut signals = SignalMap::new(id, "sim_detector", ErrorConfig::none());
        signals.add("imax", params.imax);
        signals.add("center", params.center);
        signals.add("sigma", params.sigma);
        signals.add("noise", params.noise.as_str());
        signals.add("noise_multiplier", params.noise_multiplier);
        Self {
            id: id.to_string(),
            motor,
            signals,
            value: RwLock::new(0.0),
            rng: MockRng::new(seed),
        }
    }

    /// Replace the peak parameters.
    pub fn set_params(&self, params: PeakParams) {
        self.signals.poke("imax", params.imax);
        self.signals.poke("center", params.center);
        self.signals.poke("sigma", params.sigma);
        self.signals.poke("noise", params.noise.as_str());
        self.signals.poke("noise_multiplier", params.noise_multiplier);
    }

    /// Current peak parameters. Unparseable signal values fall back to the defaults.
    pub fn params(&self) -> PeakParams {
        let defaults = PeakParams::default();
        let number = |path: &str, fallback: f64| {
            self.signals
                .peek(path)
                .and_then(|v| v.as_f64())
                .unwrap_or(fallback)
        };
        PeakParams {
            imax: number("imax", defaults.imax),
            center: number("center", defaults.center),
            sigma: number("sigma", defaults.sigma),
            noise: self
                .signals
                .peek("noise")
                .and_then(|v| v.to_string().parse().ok())
                .unwrap_or(defaults.noise),
            noise_multiplier: number("noise_multiplier", defaults.noise_multiplier),
        }
    }

    fn sample(&self, x: f64) -> f64 {
        let p = self.params();
        let sigma = if p.sigma == 0.0 { f64::EPSILON } else { p.sigma };
        let clean = p.imax * (-(x - p.center).powi(2) / (2.0 * sigma * sigma)).exp();
        match p.noise {
            Noise::None => clean,
            Noise::Poisson => self.rng.next_poisson(clean) as f64,
            Noise::Uniform => clean + p.noise_multiplier * (2.0 * self.rng.next_f64() - 1.0),
        }
    }
}

impl SignalTree for SimDetector {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.signal(path)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.signal_paths()
    }
}

#[async_trait]
impl Triggerable for SimDetector {
    async fn trigger(&self) -> Result<()> {
        let x = self.motor.position().await?;
        let sample = self.sample(x);
        *self.value.write() = sample;
        Ok(())
    }
}

#[async_trait]
impl Readable for SimDetector {
    async fn read(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut values = serde_json::Map::new();
        values.insert(self.id.clone(), serde_json::json!(*self.value.read()));
        Ok(values)
    }

    async fn describe(&self) -> Result<Vec<(String, DataKey)>> {
        Ok(vec![(self.id.clone(), DataKey::scalar(&self.id, "counts"))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peak_at_center() {
        let motor = Arc::new(SimMotor::new("sim_motor"));
        let det = SimDetector::new("sim_det", motor.clone(), PeakParams::default(), Some(1));

        motor.move_abs(0.0).await.unwrap();
        det.trigger().await.unwrap();
        let at_center = det.read().await.unwrap()["sim_det"].as_f64().unwrap_or_default();
        assert!((at_center - 10_000.0).abs() < 1e-9);

        motor.move_abs(2.0).await.unwrap();
        det.trigger().await.unwrap();
        let off_center = det.read().await.unwrap()["sim_det"].as_f64().unwrap_or_default();
        assert!(off_center < at_center);
    }

    #[tokio::test]
    async fn test_uniform_noise_is_bounded() {
        let motor = Arc::new(SimMotor::new("sim_motor"));
        let params = PeakParams {
            noise: Noise::Uniform,
            noise_multiplier: 0.5,
            ..PeakParams::default()
        };
        let det = SimDetector::new("sim_det", motor, params, Some(9));
        for _ in 0..20 {
            det.trigger().await.unwrap();
            let v = det.read().await.unwrap()["sim_det"].as_f64().unwrap_or_default();
            assert!((v - 10_000.0).abs() <= 0.5);
        }
    }

    #[tokio::test]
    async fn test_peak_retuned_through_signals() {
        let motor = Arc::new(SimMotor::new("sim_motor"));
        let det = SimDetector::new("sim_det", motor, PeakParams::default(), None);
        let imax = det.signal("imax").unwrap();
        imax.set_value(500.0.into()).await.unwrap();
        det.signal("noise").unwrap().set_value("poisson".into()).await.unwrap();

        let params = det.params();
        assert_eq!(params.imax, 500.0);
        assert_eq!(params.noise, Noise::Poisson);
    }

    #[test]
    fn test_noise_parse() {
        assert_eq!("poisson".parse::<Noise>().ok(), Some(Noise::Poisson));
        assert!("gaussian".parse::<Noise>().is_err());
    }
}
