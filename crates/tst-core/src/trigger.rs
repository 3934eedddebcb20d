//! Lifecycle states and timing records shared by all coordination objects.

use serde::{Deserialize, Serialize};

// =============================================================================
// TriggerState
// =============================================================================

/// Lifecycle state of a trigger logic, flyer or coordinator.
///
/// Every coordination entity owns exactly one current state and only moves
/// between states through its lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    /// Nothing prepared yet.
    #[default]
    Null,
    /// Point count bound, hardware being configured.
    Preparing,
    /// Acquisition running.
    Starting,
    /// Acquisition being stopped.
    Stopping,
    /// Acquisition finished cleanly.
    Complete,
    /// Something failed, or an abort happened.
    Error,
}

impl TriggerState {
    /// States from which a fresh `prepare` is allowed.
    pub fn is_resettable(self) -> bool {
        matches!(self, TriggerState::Null | TriggerState::Complete | TriggerState::Error)
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TriggerState::Null => "null",
            TriggerState::Preparing => "preparing",
            TriggerState::Starting => "starting",
            TriggerState::Stopping => "stopping",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
        };
        f.write_str(label)
    }
}

// =============================================================================
// TriggerInfo
// =============================================================================

/// How a detector is triggered for each point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorTrigger {
    /// Free-running on the detector's own clock.
    #[default]
    Internal,
    /// One frame per rising edge.
    EdgeTrigger,
    /// Fixed-width gate per point.
    ConstantGate,
    /// Gate width follows the external signal.
    VariableGate,
}

/// Immutable timing record handed to a device to arm it.
///
/// `total_time` is derived as `count * deadtime` when the record is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Number of trigger points.
    pub count: u64,
    /// Trigger mode.
    pub trigger: DetectorTrigger,
    /// Minimum cycle time per point in seconds.
    pub deadtime: f64,
    /// Active exposure per point in seconds.
    pub livetime: f64,
    /// Duration of the whole acquisition in seconds.
    pub total_time: f64,
}

impl TriggerInfo {
    /// Build a record, deriving `total_time`.
    pub fn new(count: u64, trigger: DetectorTrigger, deadtime: f64, livetime: f64) -> Self {
        Self {
            count,
            trigger,
            deadtime,
            livetime,
            total_time: count as f64 * deadtime,
        }
    }

    /// `livetime < deadtime`, i.e. the detector has time to read out.
    pub fn has_sane_duty_cycle(&self) -> bool {
        self.livetime < self.deadtime
    }
}

/// Timing parameters a flyer exposes to the timing validator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingParams {
    /// Number of triggers.
    pub num_triggers: u64,
    /// Deadtime in seconds.
    pub deadtime: f64,
    /// Livetime in seconds.
    pub livetime: f64,
    /// Total acquisition time in seconds.
    pub total_time: f64,
}

impl From<&TriggerInfo> for TimingParams {
    fn from(info: &TriggerInfo) -> Self {
        Self {
            num_triggers: info.count,
            deadtime: info.deadtime,
            livetime: info.livetime,
            total_time: info.total_time,
        }
    }
}

// =============================================================================
// Prepare payloads
// =============================================================================

/// Trajectory for a motor taking part in a fly scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyMotorInfo {
    /// Position the motor ramps up from.
    pub start_position: f64,
    /// Position the motor ramps down at.
    pub end_position: f64,
    /// Seconds the move between the two should take.
    pub time_for_move: f64,
}

impl FlyMotorInfo {
    /// Velocity needed to cover the trajectory in `time_for_move`.
    pub fn velocity(&self) -> f64 {
        if self.time_for_move <= 0.0 {
            return 0.0;
        }
        (self.end_position - self.start_position).abs() / self.time_for_move
    }
}

/// Payload of the plan protocol's `prepare` step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrepareInfo {
    /// Arm a detector or trigger box.
    Trigger(TriggerInfo),
    /// Set up a motor trajectory.
    FlyMotor(FlyMotorInfo),
}

impl From<TriggerInfo> for PrepareInfo {
    fn from(info: TriggerInfo) -> Self {
        PrepareInfo::Trigger(info)
    }
}

impl From<FlyMotorInfo> for PrepareInfo {
    fn from(info: FlyMotorInfo) -> Self {
        PrepareInfo::FlyMotor(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_time_is_derived() {
        let info = TriggerInfo::new(20, DetectorTrigger::ConstantGate, 0.005, 0.0045);
        assert!((info.total_time - 0.1).abs() < 1e-12);
        assert!(info.has_sane_duty_cycle());
    }

    #[test]
    fn test_state_tags_match_serde() {
        for state in [
            TriggerState::Null,
            TriggerState::Preparing,
            TriggerState::Starting,
            TriggerState::Stopping,
            TriggerState::Complete,
            TriggerState::Error,
        ] {
            let json = serde_json::to_string(&state).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_resettable_states() {
        assert!(TriggerState::Null.is_resettable());
        assert!(TriggerState::Complete.is_resettable());
        assert!(TriggerState::Error.is_resettable());
        assert!(!TriggerState::Preparing.is_resettable());
        assert!(!TriggerState::Starting.is_resettable());
        assert!(!TriggerState::Stopping.is_resettable());
    }

    #[test]
    fn test_fly_motor_velocity() {
        let info = FlyMotorInfo {
            start_position: -5.0,
            end_position: 185.0,
            time_for_move: 9.0,
        };
        assert!((info.velocity() - 190.0 / 9.0).abs() < 1e-12);
    }
}
