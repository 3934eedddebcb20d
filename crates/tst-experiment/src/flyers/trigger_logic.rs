//! Trigger timing state machine.
//!
//! `TriggerLogic` owns no hardware. It turns a point count into a
//! [`TriggerInfo`] and tracks where the acquisition is in its
//! prepare → start → stop lifecycle.
//!
//! ```text
//!  Null/Complete/Error ──prepare──▶ Preparing ──start──▶ Starting
//!          ▲                                                │
//!          └──────────── Complete ◀── Stopping ◀──stop──────┘
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tst_core::error::{FlyError, FlyResult};
use tst_core::policy::LivetimePolicy;
use tst_core::trigger::{DetectorTrigger, TriggerInfo, TriggerState};
use tst_hardware::config::CoordinationConfig;

/// Shortest deadtime the trigger hardware supports, in seconds.
pub const MIN_DEADTIME: f64 = 0.001;

/// Deadtime budget spread over all points, in seconds.
pub const DEADTIME_BUDGET: f64 = 0.1;

/// Knobs shared by every trigger logic in a coordinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSettings {
    /// Livetime as a fraction of deadtime.
    pub duty_cycle: f64,
    /// Check livetime against deadtime during `prepare`.
    pub validate: bool,
    /// What a failed livetime check does.
    pub livetime_policy: LivetimePolicy,
    /// Settle time at the end of `prepare`.
    pub prepare_settle: Duration,
    /// Settle time between `Stopping` and `Complete`.
    pub stop_settle: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            duty_cycle: 0.9,
            validate: true,
            livetime_policy: LivetimePolicy::Warn,
            prepare_settle: Duration::from_millis(10),
            stop_settle: Duration::from_millis(1),
        }
    }
}

impl From<&CoordinationConfig> for TriggerSettings {
    fn from(config: &CoordinationConfig) -> Self {
        Self {
            duty_cycle: config.duty_cycle,
            validate: true,
            livetime_policy: config.livetime_policy,
            prepare_settle: Duration::from_millis(config.prepare_settle_ms),
            stop_settle: Duration::from_millis(config.stop_settle_ms),
        }
    }
}

/// Timing state machine for one flyer.
#[derive(Debug)]
pub struct TriggerLogic {
    name: String,
    state: TriggerState,
    settings: TriggerSettings,
    prepared_count: Option<u64>,
    trigger_info: Option<TriggerInfo>,
    start_time: Option<Instant>,
}

impl TriggerLogic {
    /// Logic with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, TriggerSettings::default())
    }

    /// Logic with explicit settings.
    pub fn with_settings(name: impl Into<String>, settings: TriggerSettings) -> Self {
        Self {
            name: name.into(),
            state: TriggerState::Null,
            settings,
            prepared_count: None,
            trigger_info: None,
            start_time: None,
        }
    }

    /// Override the livetime fraction.
    pub fn with_duty_cycle(mut self, duty_cycle: f64) -> Self {
        self.settings.duty_cycle = duty_cycle;
        self
    }

    /// Name used in log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Settings in force.
    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// Point count bound by the last successful `prepare`, until `stop`.
    pub fn prepared_count(&self) -> Option<u64> {
        self.prepared_count
    }

    /// Timing computed by the last successful `prepare`.
    pub fn trigger_info(&self) -> Option<TriggerInfo> {
        self.trigger_info
    }

    /// Time since `start`, while running.
    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    /// Timing for `point_count` points.
    ///
    /// `deadtime = max(0.001, 0.1 / n)`, `livetime = duty_cycle * deadtime`,
    /// `total_time = n * deadtime`, gated with a constant gate.
    pub fn compute_trigger_info(&self, point_count: i64) -> FlyResult<TriggerInfo> {
        let count = u64::try_from(point_count)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                FlyError::InvalidArgument(format!("Invalid number of points: {}", point_count))
            })?;
        let deadtime = MIN_DEADTIME.max(DEADTIME_BUDGET / count as f64);
        let livetime = self.settings.duty_cycle * deadtime;
        Ok(TriggerInfo::new(
            count,
            DetectorTrigger::ConstantGate,
            deadtime,
            livetime,
        ))
    }

    /// Bind `point_count` and compute its timing.
    pub async fn prepare(&mut self, point_count: i64) -> FlyResult<TriggerInfo> {
        if !self.state.is_resettable() {
            return Err(FlyError::InvalidState {
                operation: "prepare",
                state: self.state,
            });
        }

        info!(logic = %self.name, points = point_count, "Preparing trigger logic");
        self.state = TriggerState::Preparing;

        let info = match self.compute_trigger_info(point_count) {
            Ok(info) => info,
            Err(e) => {
                self.fail();
                error!(logic = %self.name, error = %e, "Trigger logic preparation failed");
                return Err(e);
            }
        };

        debug!(
            logic = %self.name,
            deadtime = info.deadtime,
            livetime = info.livetime,
            total_time = info.total_time,
            "Trigger timing"
        );

        if self.settings.validate && !info.has_sane_duty_cycle() {
            let message = format!(
                "livetime {:.6}s is not shorter than deadtime {:.6}s",
                info.livetime, info.deadtime
            );
            match self.settings.livetime_policy {
                LivetimePolicy::Warn => warn!(logic = %self.name, "{}", message),
                LivetimePolicy::Reject => {
                    self.fail();
                    error!(logic = %self.name, "{}", message);
                    return Err(FlyError::InvalidArgument(message));
                }
            }
        }

        self.prepared_count = Some(info.count);
        self.trigger_info = Some(info);

        tokio::time::sleep(self.settings.prepare_settle).await;
        debug!(logic = %self.name, points = info.count, "Trigger logic preparation complete");
        Ok(info)
    }

    /// Start the trigger sequence.
    pub fn start(&mut self) -> FlyResult<()> {
        if self.prepared_count.is_none() || self.state != TriggerState::Preparing {
            return Err(FlyError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        info!(logic = %self.name, "Starting trigger sequence");
        self.state = TriggerState::Starting;
        self.start_time = Some(Instant::now());
        Ok(())
    }

    /// Stop the trigger sequence. Never fails.
    pub async fn stop(&mut self) {
        info!(logic = %self.name, "Stopping trigger sequence");
        self.state = TriggerState::Stopping;
        tokio::time::sleep(self.settings.stop_settle).await;
        self.state = TriggerState::Complete;

        if let Some(start) = self.start_time.take() {
            debug!(
                logic = %self.name,
                duration_s = start.elapsed().as_secs_f64(),
                "Trigger sequence completed"
            );
        }
        self.prepared_count = None;
    }

    /// Drop the prepared count and enter `Error`.
    pub fn fail(&mut self) {
        self.state = TriggerState::Error;
        self.prepared_count = None;
        self.start_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn quick() -> TriggerSettings {
        TriggerSettings {
            prepare_settle: Duration::ZERO,
            stop_settle: Duration::ZERO,
            ..TriggerSettings::default()
        }
    }

    #[test]
    fn test_trigger_info_formula() {
        let logic = TriggerLogic::new("t");
        for n in 1..=500i64 {
            let info = logic.compute_trigger_info(n).unwrap();
            let expected = f64::max(0.001, 0.1 / n as f64);
            assert!(info.deadtime >= 0.001);
            assert_eq!(info.deadtime, expected);
            assert!((info.livetime - 0.9 * info.deadtime).abs() < 1e-15);
            assert!((info.total_time - n as f64 * info.deadtime).abs() < 1e-12);
            assert_eq!(info.trigger, DetectorTrigger::ConstantGate);
        }
    }

    #[test]
    fn test_trigger_info_rejects_non_positive() {
        let logic = TriggerLogic::new("t");
        assert!(matches!(
            logic.compute_trigger_info(0),
            Err(FlyError::InvalidArgument(_))
        ));
        assert!(matches!(
            logic.compute_trigger_info(-5),
            Err(FlyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_start_before_prepare() {
        let mut logic = TriggerLogic::new("t");
        assert!(matches!(
            logic.start(),
            Err(FlyError::InvalidState { operation: "start", state: TriggerState::Null })
        ));
    }

    #[tokio::test]
    async fn test_prepare_then_start() {
        let mut logic = TriggerLogic::with_settings("t", quick());
        let info = logic.prepare(10).await.unwrap();
        assert_eq!(info.count, 10);
        assert_eq!(logic.state(), TriggerState::Preparing);
        logic.start().unwrap();
        assert_eq!(logic.state(), TriggerState::Starting);
        assert!(logic.elapsed().is_some());
    }

    #[tokio::test]
    async fn test_prepare_refused_while_running() {
        let mut logic = TriggerLogic::with_settings("t", quick());
        logic.prepare(10).await.unwrap();
        assert!(matches!(
            logic.prepare(10).await,
            Err(FlyError::InvalidState { state: TriggerState::Preparing, .. })
        ));
        logic.start().unwrap();
        assert!(matches!(
            logic.prepare(10).await,
            Err(FlyError::InvalidState { state: TriggerState::Starting, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_count_enters_error_and_is_resettable() {
        let mut logic = TriggerLogic::with_settings("t", quick());
        assert!(logic.prepare(0).await.is_err());
        assert_eq!(logic.state(), TriggerState::Error);
        logic.prepare(3).await.unwrap();
        assert_eq!(logic.state(), TriggerState::Preparing);
    }

    #[tokio::test]
    async fn test_stop_clears_count() {
        let mut logic = TriggerLogic::with_settings("t", quick());
        logic.prepare(4).await.unwrap();
        logic.start().unwrap();
        logic.stop().await;
        assert_eq!(logic.state(), TriggerState::Complete);
        assert_eq!(logic.prepared_count(), None);
        assert!(logic.start().is_err());
        // Stop from anywhere is fine.
        logic.stop().await;
        assert_eq!(logic.state(), TriggerState::Complete);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_livetime_warning_does_not_fail() {
        let mut logic = TriggerLogic::with_settings("t", quick()).with_duty_cycle(1.0);
        logic.prepare(10).await.unwrap();
        assert!(logs_contain("is not shorter than deadtime"));
        assert_eq!(logic.state(), TriggerState::Preparing);
    }

    #[tokio::test]
    async fn test_livetime_reject_policy() {
        let settings = TriggerSettings {
            livetime_policy: LivetimePolicy::Reject,
            ..quick()
        };
        let mut logic = TriggerLogic::with_settings("t", settings).with_duty_cycle(1.0);
        assert!(matches!(
            logic.prepare(10).await,
            Err(FlyError::InvalidArgument(_))
        ));
        assert_eq!(logic.state(), TriggerState::Error);
    }

    #[test]
    fn test_settings_from_config() {
        let config = CoordinationConfig {
            prepare_settle_ms: 25,
            duty_cycle: 0.5,
            ..CoordinationConfig::default()
        };
        let settings = TriggerSettings::from(&config);
        assert_eq!(settings.prepare_settle, Duration::from_millis(25));
        assert_eq!(settings.duty_cycle, 0.5);
    }
}
