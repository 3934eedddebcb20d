//! Instrument configuration.
//!
//! Loaded with figment from an optional TOML file, then `TST_`-prefixed
//! environment variables (nested keys split on `__`, e.g.
//! `TST_COORDINATION__TIMING_POLICY=reject`), and checked with serde_valid.
//!
//! ```toml
//! mock_mode = true
//! beamline_acronym = "tst"
//!
//! [coordination]
//! livetime_policy = "warn"
//! timing_ratio_threshold = 1.1
//!
//! [[devices]]
//! id = "manta1"
//! driver = "mock_manta"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tst_core::{LivetimePolicy, TimingPolicy};

/// Environment variables that force mock mode when set to `YES`.
pub const MOCK_MODE_ENV_VARS: [&str; 2] = ["TST_MOCK_MODE", "RUNNING_IN_NSLS2_CI"];

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Figment could not read or deserialize the sources.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Schema or cross-field validation failed.
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// A directory needed for data could not be created.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The creation depth forbids creating a missing directory.
    #[error("Directory {} is missing and create_dir_depth {depth} does not allow creating it", path.display())]
    DirectoryNotCreatable {
        /// First missing directory the writer may not create.
        path: PathBuf,
        /// Depth in force.
        depth: i32,
    },
}

/// Path provider overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PathsConfig {
    /// Proposals root replacing the built-in one.
    pub root: Option<PathBuf>,
    /// Proposal id.
    pub proposal_id: Option<String>,
    /// Facility cycle.
    pub cycle: Option<String>,
    /// Data session.
    pub data_session: Option<String>,
    /// Directory creation depth.
    pub create_dir_depth: Option<i32>,
}

/// Knobs of the coordination core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Reaction to livetime exceeding deadtime.
    pub livetime_policy: LivetimePolicy,
    /// Reaction to inconsistent flyer timing.
    pub timing_policy: TimingPolicy,
    /// Max/min ratio above which timing is flagged.
    #[validate(exclusive_minimum = 1.0)]
    pub timing_ratio_threshold: f64,
    /// Settle delay after configuring hardware, in milliseconds.
    #[validate(maximum = 10_000)]
    pub prepare_settle_ms: u64,
    /// Settle delay while stopping, in milliseconds.
    #[validate(maximum = 10_000)]
    pub stop_settle_ms: u64,
    /// Livetime as a fraction of deadtime.
    #[validate(exclusive_minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub duty_cycle: f64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            livetime_policy: LivetimePolicy::Warn,
            timing_policy: TimingPolicy::Warn,
            timing_ratio_threshold: 1.1,
            prepare_settle_ms: 10,
            stop_settle_ms: 1,
            duty_cycle: 0.9,
        }
    }
}

/// One device to build through a registered driver factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DeviceConfig {
    /// Unique device id.
    #[validate(min_length = 1)]
    #[validate(max_length = 64)]
    pub id: String,
    /// Display name, defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Driver type of a registered factory.
    #[validate(min_length = 1)]
    pub driver: String,
    /// Driver-specific options.
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level instrument configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Build mock devices instead of talking to hardware.
    pub mock_mode: bool,
    /// Beamline acronym; empty means "look at the environment".
    pub beamline_acronym: String,
    /// Path provider overrides.
    #[validate]
    pub paths: PathsConfig,
    /// Coordination knobs.
    #[validate]
    pub coordination: CoordinationConfig,
    /// Devices to build. Empty with mock mode means the standard mock set.
    #[validate]
    pub devices: Vec<DeviceConfig>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            mock_mode: true,
            beamline_acronym: String::new(),
            paths: PathsConfig::default(),
            coordination: CoordinationConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl InstrumentConfig {
    /// Load defaults, then `path` if given, then `TST_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(InstrumentConfig::default()));
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading instrument config");
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("TST_").split("__").ignore(&["MOCK_MODE"]));
        Self::from_figment(figment)
    }

    /// Parse a TOML string over the defaults, ignoring the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(InstrumentConfig::default()))
                .merge(Toml::string(content)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: InstrumentConfig = figment.extract().map_err(Box::new)?;
        if mock_mode_forced() {
            config.mock_mode = true;
        }
        config.check()?;
        info!(
            mock_mode = config.mock_mode,
            devices = config.devices.len(),
            "Instrument configuration loaded"
        );
        Ok(config)
    }

    /// Run schema and cross-field validation.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|errors| ConfigError::Validation(errors.to_string()))?;

        if let Some(depth) = self.paths.create_dir_depth {
            if depth.abs() > 16 {
                return Err(ConfigError::Validation(format!(
                    "paths.create_dir_depth {} is outside -16..=16",
                    depth
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
        }
        Ok(())
    }

    /// Acronym from config, falling back to the environment.
    pub fn acronym(&self) -> String {
        if self.beamline_acronym.is_empty() {
            crate::providers::beamline_acronym()
        } else {
            self.beamline_acronym.to_lowercase()
        }
    }
}

/// True when any of [`MOCK_MODE_ENV_VARS`] equals `YES`.
pub fn mock_mode_forced() -> bool {
    MOCK_MODE_ENV_VARS
        .iter()
        .any(|var| std::env::var(var).map(|v| v == "YES").unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        let config = InstrumentConfig::from_toml_str("").unwrap();
        assert!(config.mock_mode);
        assert_eq!(config.coordination.timing_ratio_threshold, 1.1);
        assert_eq!(config.coordination.livetime_policy, LivetimePolicy::Warn);
        assert!(config.devices.is_empty());
    }

    #[test]
    #[serial]
    fn test_devices_and_policies_parse() {
        let config = InstrumentConfig::from_toml_str(
            r#"
            mock_mode = false
            beamline_acronym = "TST"

            [coordination]
            timing_policy = "reject"
            duty_cycle = 0.5

            [[devices]]
            id = "panda1"
            driver = "mock_panda"

            [devices.config]
            mode = "realistic"
            "#,
        )
        .unwrap();
        assert_eq!(config.coordination.timing_policy, TimingPolicy::Reject);
        assert_eq!(config.coordination.duty_cycle, 0.5);
        assert_eq!(config.devices[0].driver, "mock_panda");
        assert_eq!(config.acronym(), "tst");
    }

    #[test]
    #[serial]
    fn test_invalid_threshold_rejected() {
        let result = InstrumentConfig::from_toml_str(
            r#"
            [coordination]
            timing_ratio_threshold = 0.5
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    #[serial]
    fn test_duplicate_device_ids_rejected() {
        let result = InstrumentConfig::from_toml_str(
            r#"
            [[devices]]
            id = "m"
            driver = "mock_motor"
            [[devices]]
            id = "m"
            driver = "mock_motor"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    #[serial]
    fn test_ci_variable_forces_mock_mode() {
        std::env::set_var("RUNNING_IN_NSLS2_CI", "YES");
        let config = InstrumentConfig::from_toml_str("mock_mode = false").unwrap();
        std::env::remove_var("RUNNING_IN_NSLS2_CI");
        assert!(config.mock_mode);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tst.toml");
        std::fs::write(&path, "mock_mode = true\n").unwrap();

        std::env::set_var("TST_COORDINATION__PREPARE_SETTLE_MS", "25");
        let config = InstrumentConfig::load(Some(&path));
        std::env::remove_var("TST_COORDINATION__PREPARE_SETTLE_MS");

        assert_eq!(config.unwrap().coordination.prepare_settle_ms, 25);
    }
}
