//! Error injection for mock devices.
//!
//! Operations are identified by string keys. Devices use the phase names
//! (`stage`, `prepare`, `kickoff`, `complete`, `collect`, `connect`) and
//! signals use `get:<path>` / `set:<path>`, so a test can break exactly one
//! signal (`set:pcap.arm`) or one phase of one device.

use super::rng::MockRng;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tst_core::error::{DriverError, DriverErrorKind};

/// Wildcard key matching every operation.
pub const ANY_OPERATION: &str = "*";

/// Error injection configuration shared by a device and its signals.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rates: Arc<HashMap<String, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

/// A deterministic failure pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Succeed `count` times, then fail every time.
    FailAfterN {
        /// Operation key.
        operation: String,
        /// Successful calls allowed.
        count: u32,
    },
    /// Always fail with a timeout.
    Timeout {
        /// Operation key.
        operation: String,
    },
    /// Always fail with a hardware error.
    Fail {
        /// Operation key.
        operation: String,
    },
    /// First operation loses the link; every later one fails too.
    CommunicationLoss,
    /// First operation latches a hardware fault code.
    HardwareFault {
        /// Fault code reported.
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<String, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    fn build(rates: HashMap<String, f64>, scenarios: Vec<ErrorScenario>, seed: Option<u64>) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// No injected errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation, optionally seeded.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert(ANY_OPERATION.to_string(), rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Always fail `operation`.
    pub fn failing(operation: impl Into<String>) -> Self {
        Self::scenario(ErrorScenario::Fail {
            operation: operation.into(),
        })
    }

    /// Per-operation failure rates.
    pub fn with_rates(rates: HashMap<String, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    /// Decide whether `operation` fails now.
    pub fn check_operation(&self, driver_type: &str, operation: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }

        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if op == operation => {
                    let current = state.operation_counts.entry(operation.to_string()).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::Fail { operation: op } if op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Injected failure on '{}'", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get(ANY_OPERATION))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_fails() {
        let errors = ErrorConfig::none();
        for _ in 0..100 {
            assert!(errors.check_operation("mock_panda", "kickoff").is_ok());
        }
    }

    #[test]
    fn test_fail_after_n() {
        let errors = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "set:pcap.arm".into(),
            count: 2,
        });
        assert!(errors.check_operation("mock_panda", "set:pcap.arm").is_ok());
        assert!(errors.check_operation("mock_panda", "set:pcap.arm").is_ok());
        assert!(errors.check_operation("mock_panda", "set:pcap.arm").is_err());
        // Other operations are unaffected.
        assert!(errors.check_operation("mock_panda", "get:pcap.arm").is_ok());
    }

    #[test]
    fn test_communication_loss_latches() {
        let errors = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        let first = errors.check_operation("mock_manta", "stage");
        let second = errors.check_operation("mock_manta", "unstage");
        assert_eq!(first.map_err(|e| e.kind).err(), Some(DriverErrorKind::Communication));
        assert!(second.is_err());

        errors.reset();
        // Scenario fires again after a reset.
        assert!(errors.check_operation("mock_manta", "stage").is_err());
    }

    #[test]
    fn test_timeout_kind() {
        let errors = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "complete".into(),
        });
        let err = errors.check_operation("mock_manta", "complete").err();
        assert_eq!(err.map(|e| e.kind), Some(DriverErrorKind::Timeout));
    }

    #[test]
    fn test_seeded_random_failures_are_reproducible() {
        let a = ErrorConfig::random_failures_seeded(0.5, Some(3));
        let b = ErrorConfig::random_failures_seeded(0.5, Some(3));
        for _ in 0..50 {
            assert_eq!(
                a.check_operation("x", "op").is_ok(),
                b.check_operation("x", "op").is_ok()
            );
        }
    }
}
