//! How coordination reacts to suspicious timing.

use serde::{Deserialize, Serialize};

/// What `TriggerLogic::prepare` does when livetime exceeds deadtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivetimePolicy {
    /// Log a warning and carry on.
    #[default]
    Warn,
    /// Refuse the configuration and enter the error state.
    Reject,
}

/// What the coordinator does when flyer timing is inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingPolicy {
    /// Report the problems, keep going.
    #[default]
    Warn,
    /// Fail preparation with the collected problems.
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies_default_to_warn() {
        assert_eq!(LivetimePolicy::default(), LivetimePolicy::Warn);
        assert_eq!(TimingPolicy::default(), TimingPolicy::Warn);
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        let policy: TimingPolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, TimingPolicy::Reject);
    }
}
