//! `tst-core`
//!
//! Core types and traits shared by the TST beamline crates.
//!
//! This crate defines the vocabulary the coordination core and the device
//! layer agree on:
//!
//! - [`trigger`]: the lifecycle state enum and the timing records a flyer
//!   hands to a device (`TriggerInfo`, `TimingParams`, `PrepareInfo`).
//! - [`capabilities`]: fine-grained async device traits (signals, capture
//!   channels, arming, staging, the prepare/kickoff/complete protocol).
//! - [`driver`]: the `DeviceComponents` bag and `DriverFactory` trait used
//!   to populate a registry.
//! - [`document`]: Bluesky-style run documents.
//! - [`status`]: named groups of in-flight device operations with a
//!   tri-state poll.
//! - [`paths`]: the path/naming provider interface for persisted data.
//! - [`policy`]: warn-or-reject switches for timing checks.
//! - [`error`]: the coordination error taxonomy.

pub mod capabilities;
pub mod document;
pub mod driver;
pub mod error;
pub mod paths;
pub mod policy;
pub mod status;
pub mod trigger;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use error::{FlyError, FlyResult};
pub use policy::{LivetimePolicy, TimingPolicy};
pub use trigger::{DetectorTrigger, PrepareInfo, TimingParams, TriggerInfo, TriggerState};
