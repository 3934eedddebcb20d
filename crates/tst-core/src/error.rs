//! Error types for flyer coordination.
//!
//! `FlyError` is the taxonomy every coordination entity reports through:
//!
//! - **`InvalidArgument`**: malformed input to a pure computation, such as a
//!   non-positive point count.
//! - **`InvalidState`**: an operation invoked out of lifecycle order.
//! - **`NotPrepared`**: an operation that needs a prior successful `prepare`.
//! - **`DeviceCommunication`**: an underlying hardware call failed. Carries
//!   the device and operation so the failure can be logged with its identity.
//! - **`CoordinationInconsistency`**: the timing validator rejected a set of
//!   flyers (only raised when the caller opts into rejecting).
//!
//! Capability traits return `anyhow::Result`; the coordination layer wraps
//! those failures into `DeviceCommunication` at the point where it knows
//! which device and operation were involved.

use crate::trigger::TriggerState;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad category of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Transport-level failure (channel access, serial, network).
    Communication,
    /// The hardware reported a fault.
    Hardware,
    /// The device did not answer in time.
    Timeout,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a device driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver type that raised the error (e.g. `mock_panda`).
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DriverError {
    /// Create a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Coordination Errors
// =============================================================================

/// Convenience alias for results using the coordination error type.
pub type FlyResult<T> = std::result::Result<T, FlyError>;

/// Error type for trigger logic, flyers and the coordinator.
#[derive(Error, Debug)]
pub enum FlyError {
    /// Malformed input to a timing computation.
    ///
    /// Raised for non-positive point counts and for plan geometry that cannot
    /// be realised (non-integral encoder steps, exposure longer than a step).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation invoked outside its allowed lifecycle order.
    ///
    /// **Recovery**: complete or abort the current acquisition, then retry.
    #[error("Cannot {operation} while in state '{state}'")]
    InvalidState {
        /// The operation that was refused.
        operation: &'static str,
        /// The state the entity was in.
        state: TriggerState,
    },

    /// Operation requires a prior successful `prepare`.
    #[error("Flyer '{0}' must be prepared before kickoff")]
    NotPrepared(String),

    /// An underlying hardware call failed.
    ///
    /// Always logged with the device identity before being returned.
    #[error("Device '{device}' failed during {operation}: {source}")]
    DeviceCommunication {
        /// Device (or device.signal) that failed.
        device: String,
        /// Operation being performed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// Timing parameters across flyers cannot be reconciled.
    #[error("Flyer timing is inconsistent: {}", .0.join("; "))]
    CoordinationInconsistency(Vec<String>),

    /// A member flyer failed during a coordinated operation.
    #[error("Flyer '{name}' failed: {source}")]
    Flyer {
        /// Name of the flyer inside the coordinator.
        name: String,
        /// What went wrong.
        #[source]
        source: Box<FlyError>,
    },

    /// Device lookup failed.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but lacks a required capability.
    #[error("Device '{device}' does not provide {capability}")]
    MissingCapability {
        /// Device id.
        device: String,
        /// Capability name.
        capability: &'static str,
    },
}

impl FlyError {
    /// Wrap a device failure with its identity.
    pub fn device(device: impl Into<String>, operation: &'static str, source: anyhow::Error) -> Self {
        FlyError::DeviceCommunication {
            device: device.into(),
            operation,
            source,
        }
    }

    /// Innermost error, looking through `Flyer` wrappers.
    pub fn root(&self) -> &FlyError {
        match self {
            FlyError::Flyer { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new("mock_panda", DriverErrorKind::Timeout, "pcap.arm");
        assert_eq!(err.to_string(), "Driver 'mock_panda' timeout error: pcap.arm");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = FlyError::InvalidState {
            operation: "start",
            state: TriggerState::Null,
        };
        assert_eq!(err.to_string(), "Cannot start while in state 'null'");
    }

    #[test]
    fn test_root_unwraps_flyer_wrappers() {
        let err = FlyError::Flyer {
            name: "panda".into(),
            source: Box::new(FlyError::NotPrepared("panda".into())),
        };
        assert!(matches!(err.root(), FlyError::NotPrepared(_)));
    }

    #[test]
    fn test_device_error_keeps_source() {
        let err = FlyError::device("panda1.pcap.arm", "kickoff", anyhow::anyhow!("link down"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("link down"));
    }
}
