//! Hardware layer for the TST instrument.
//!
//! - [`registry`]: the explicitly passed [`registry::DeviceRegistry`]
//! - [`drivers::mock`]: simulated Manta, PandA, motor and test devices
//! - [`providers`]: proposal-based file path provider
//! - [`config`]: instrument configuration (TOML + environment)
//! - [`diagnostics`]: connection checks and HDF5 plugin warm-up

pub mod config;
pub mod diagnostics;
pub mod drivers;
pub mod providers;
pub mod registry;

pub use registry::{create_mock_registry, DeviceInfo, DeviceRegistry, RegistryError};
pub use config::{ConfigError, CoordinationConfig, DeviceConfig, InstrumentConfig, PathsConfig};
pub use providers::{beamline_acronym, ensure_directory, ProposalPathProvider};
