//! Operational modes for mock devices.
//!
//! - **Instant**: zero delays, deterministic behavior for unit tests
//! - **Realistic**: acquisitions take as long as their trigger timing says

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration runs
    Realistic,
}

impl MockMode {
    /// Sleep for `duration` in realistic mode, return immediately otherwise.
    pub async fn delay(self, duration: Duration) {
        if self == MockMode::Realistic && !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Like [`MockMode::delay`] but from seconds; negative or NaN is zero.
    pub async fn delay_secs(self, seconds: f64) {
        let duration = Duration::try_from_secs_f64(seconds).unwrap_or_default();
        self.delay(duration).await;
    }
}
