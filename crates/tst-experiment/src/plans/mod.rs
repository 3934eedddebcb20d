//! Acquisition plans.
//!
//! A plan is a procedure run by the [`RunEngine`](crate::run_engine::RunEngine)
//! through a [`RunContext`]. Plans reach hardware only through the context,
//! so the engine can honour pause/abort requests and clean up after a
//! failure.
//!
//! - [`tomography`]: fly-scan tomography and dark/flat collection
//! - [`xas`]: coordinated XAS fly scan and energy calibration
//! - [`sim`]: simulator plans for development

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::run_engine::RunContext;

pub mod sim;
pub mod tomography;
pub mod xas;

pub use sim::{SimCount, SimPrint, SimRelScan};
pub use tomography::{MantaDarkFlat, TomoDemo};
pub use xas::{EnergyCalibration, XasDemo};

/// Encoder counts per full turn of the rotation stage.
pub const COUNTS_PER_REVOLUTION: f64 = 8000.0;
/// Degrees per turn.
pub const DEG_PER_REVOLUTION: f64 = 360.0;
/// Encoder counts per degree.
pub const COUNTS_PER_DEG: f64 = COUNTS_PER_REVOLUTION / DEG_PER_REVOLUTION;
/// Velocity the rotation stage is returned to after a fly scan (deg/s).
pub const RESTORE_VELOCITY: f64 = 180.0 / 2.0;

/// An acquisition procedure.
#[async_trait]
pub trait Plan: Send + Sync {
    /// Plan category, e.g. `tomography`.
    fn plan_type(&self) -> &str;

    /// Name recorded in the start document.
    fn plan_name(&self) -> &str;

    /// Arguments recorded in the start document.
    fn plan_args(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Run the plan.
    async fn run(&self, ctx: &mut RunContext) -> Result<()>;
}

/// Metadata entries a caller adds on top of a plan's own.
pub(crate) fn merge_metadata(
    mut base: serde_json::Value,
    extra: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    if let serde_json::Value::Object(entries) = &mut base {
        for (key, value) in extra {
            entries.insert(key.clone(), value.clone());
        }
    }
    base
}
