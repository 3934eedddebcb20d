//! Mock hardware for running TST plans without a beamline.
//!
//! Every device here keeps its state in memory, writes no files and can be
//! made to fail through [`common::ErrorConfig`]. Register the factories with
//! a [`crate::DeviceRegistry`] or use [`crate::create_mock_registry`] for the
//! standard TST set.

pub mod common;
pub mod factories;
pub mod manta;
pub mod motor;
pub mod panda;
pub mod signal;
pub mod sim;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng};
pub use factories::{
    MockMantaFactory, MockMotorFactory, MockPandaFactory, SimDetectorFactory, SimMotorFactory,
};
pub use manta::MockManta;
pub use motor::MockMotor;
pub use panda::MockPanda;
pub use signal::{MockSignal, SignalMap};
pub use sim::{Noise, PeakParams, SimDetector, SimMotor};
