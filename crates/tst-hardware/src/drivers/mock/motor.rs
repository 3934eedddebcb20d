//! Simulated rotation stage that can take part in fly scans.

use super::common::{ErrorConfig, MockMode};
use super::signal::SignalMap;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tst_core::capabilities::{
    Connectable, Flyable, Movable, Preparable, Readable, Signal, SignalTree, Stageable,
};
use tst_core::document::DataKey;
use tst_core::trigger::{FlyMotorInfo, PrepareInfo};

const DRIVER_TYPE: &str = "mock_motor";

/// Velocity a freshly booted stage moves at (deg/s).
pub const DEFAULT_VELOCITY: f64 = 90.0;

#[derive(Default)]
struct MotorState {
    fly_info: Option<FlyMotorInfo>,
    flying: bool,
}

/// Simulated motor with `user_readback`, `user_setpoint` and `velocity` signals.
pub struct MockMotor {
    id: String,
    units: String,
    signals: SignalMap,
    mode: MockMode,
    errors: ErrorConfig,
    state: Mutex<MotorState>,
}

impl MockMotor {
    /// Motor at position 0 with default velocity.
    pub fn new(id: &str) -> Self {
        Self::with_options(id, "deg", MockMode::Instant, ErrorConfig::none())
    }

    /// Motor with explicit units, timing mode and error injection.
    pub fn with_options(id: &str, units: &str, mode: MockMode, errors: ErrorConfig) -> Self {
        let mut signals = SignalMap::new(id, DRIVER_TYPE, errors.clone());
        signals.add("user_readback", 0.0);
        signals.add("user_setpoint", 0.0);
        signals.add("velocity", DEFAULT_VELOCITY);
        Self {
            id: id.to_string(),
            units: units.to_string(),
            signals,
            mode,
            errors,
            state: Mutex::new(MotorState::default()),
        }
    }

    /// Between kickoff and complete.
    pub fn is_flying(&self) -> bool {
        self.state.lock().flying
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.errors.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    fn peek_f64(&self, path: &str) -> f64 {
        self.signals.peek(path).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    async fn travel(&self, target: f64) {
        let distance = (target - self.peek_f64("user_readback")).abs();
        let velocity = self.peek_f64("velocity");
        if velocity > 0.0 {
            self.mode.delay_secs(distance / velocity).await;
        }
        self.signals.poke("user_readback", target);
    }
}

impl SignalTree for MockMotor {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.signal(path)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.signal_paths()
    }
}

#[async_trait]
impl Movable for MockMotor {
    async fn move_abs(&self, position: f64) -> Result<()> {
        let setpoint = self
            .signals
            .get("user_setpoint")
            .ok_or_else(|| anyhow!("{} has no setpoint", self.id))?;
        setpoint.set_value(position.into()).await?;
        self.travel(position).await;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        self.check("get:user_readback")?;
        Ok(self.peek_f64("user_readback"))
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !(velocity.is_finite() && velocity > 0.0) {
            bail!("{}: velocity must be positive, got {}", self.id, velocity);
        }
        let signal = self
            .signals
            .get("velocity")
            .ok_or_else(|| anyhow!("{} has no velocity", self.id))?;
        signal.set_value(velocity.into()).await
    }

    async fn velocity(&self) -> Result<f64> {
        self.check("get:velocity")?;
        Ok(self.peek_f64("velocity"))
    }
}

#[async_trait]
impl Stageable for MockMotor {
    async fn stage(&self) -> Result<()> {
        self.check("stage")
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        let mut state = self.state.lock();
        state.fly_info = None;
        state.flying = false;
        Ok(())
    }
}

#[async_trait]
impl Preparable for MockMotor {
    async fn prepare(&self, info: PrepareInfo) -> Result<()> {
        self.check("prepare")?;
        let PrepareInfo::FlyMotor(info) = info else {
            bail!("{} can only be prepared with a motor trajectory", self.id);
        };
        self.move_abs(info.start_position).await?;
        let velocity = info.velocity();
        if velocity > 0.0 {
            self.set_velocity(velocity).await?;
        }
        self.state.lock().fly_info = Some(info);
        Ok(())
    }
}

#[async_trait]
impl Flyable for MockMotor {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        let mut state = self.state.lock();
        if state.fly_info.is_none() {
            bail!("{} kicked off before prepare", self.id);
        }
        state.flying = true;
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        let info = self
            .state
            .lock()
            .fly_info
            .ok_or_else(|| anyhow!("{} completed before prepare", self.id))?;
        self.signals.poke("user_setpoint", info.end_position);
        self.travel(info.end_position).await;
        self.state.lock().flying = false;
        Ok(())
    }
}

#[async_trait]
impl Readable for MockMotor {
    async fn read(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut values = serde_json::Map::new();
        values.insert(self.id.clone(), serde_json::json!(self.position().await?));
        Ok(values)
    }

    async fn describe(&self) -> Result<Vec<(String, DataKey)>> {
        Ok(vec![(self.id.clone(), DataKey::scalar(&self.id, &self.units))])
    }
}

#[async_trait]
impl Connectable for MockMotor {
    async fn is_connected(&self) -> Result<bool> {
        Ok(self.check("connect").is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fly_trajectory() {
        let motor = MockMotor::new("rot_motor");
        let info = FlyMotorInfo {
            start_position: -5.0,
            end_position: 185.0,
            time_for_move: 9.0,
        };
        motor.prepare(info.into()).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), -5.0);
        assert!((motor.velocity().await.unwrap() - 190.0 / 9.0).abs() < 1e-9);

        motor.kickoff().await.unwrap();
        motor.complete().await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 185.0);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_velocity() {
        let motor = MockMotor::new("rot_motor");
        assert!(motor.set_velocity(0.0).await.is_err());
        assert!(motor.set_velocity(-1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_info_is_rejected() {
        use tst_core::trigger::{DetectorTrigger, TriggerInfo};
        let motor = MockMotor::new("rot_motor");
        let info = TriggerInfo::new(1, DetectorTrigger::Internal, 0.1, 0.05);
        assert!(motor.prepare(info.into()).await.is_err());
    }
}
