//! Flyer coordination.
//!
//! - [`trigger_logic`]: per-stream timing and lifecycle
//! - [`flyer`]: the [`Flyer`] protocol and [`DeviceFlyer`] over Manta/PandA/generic endpoints
//! - [`timing`]: cross-flyer timing checks
//! - [`coordinator`]: fan-out lifecycle over several flyers
//! - [`factory`]: flyers and coordinators built from registry devices

pub mod coordinator;
pub mod factory;
pub mod flyer;
pub mod timing;
pub mod trigger_logic;

pub use coordinator::{AbortReport, FlyerCoordinator};
pub use factory::{create_advanced_flyer_coordinator, create_flyers, StandardFlyers};
pub use flyer::{DeviceFlyer, Flyer, FlyerKind};
pub use timing::{TimingValidator, ValidationReport};
pub use trigger_logic::{TriggerLogic, TriggerSettings};
