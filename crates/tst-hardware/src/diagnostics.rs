//! Start-up checks for the registered instrument.

use crate::registry::DeviceRegistry;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tst_core::driver::Capability;

/// Result of [`validate_device_connections`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    /// Devices that answered.
    pub connected: Vec<String>,
    /// Devices that reported themselves disconnected.
    pub disconnected: Vec<String>,
    /// Devices whose state could not be determined, or that have no
    /// connection check at all.
    pub errors: Vec<String>,
}

impl ConnectionReport {
    /// Every device answered.
    pub fn all_connected(&self) -> bool {
        self.disconnected.is_empty() && self.errors.is_empty()
    }
}

/// Ask every registered device whether it is connected.
pub async fn validate_device_connections(registry: &DeviceRegistry) -> ConnectionReport {
    info!("Validating device connections");
    let mut report = ConnectionReport::default();

    for device in registry.list_devices() {
        let Some(connectable) = registry.get_connectable(&device.id) else {
            warn!(device = %device.id, "Device has no connection status check");
            report.errors.push(device.id);
            continue;
        };
        debug!(device = %device.id, "Checking connection");
        match connectable.is_connected().await {
            Ok(true) => report.connected.push(device.id),
            Ok(false) => {
                warn!(device = %device.id, "Device is not connected");
                report.disconnected.push(device.id);
            }
            Err(e) => {
                error!(device = %device.id, error = %e, "Error checking connection");
                report.errors.push(device.id);
            }
        }
    }

    info!(
        connected = report.connected.len(),
        disconnected = report.disconnected.len(),
        errors = report.errors.len(),
        "Connection validation completed"
    );
    report
}

/// Result of [`warmup_hdf5_plugins`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    /// Detectors that were pushed a frame.
    pub warmed: Vec<String>,
    /// Detectors whose plugin already knew its array size.
    pub skipped: Vec<String>,
    /// Detectors whose warm-up failed.
    pub failed: Vec<String>,
}

/// Push one frame through every HDF5 plugin that has not seen one yet.
pub async fn warmup_hdf5_plugins(registry: &DeviceRegistry) -> WarmupReport {
    let mut report = WarmupReport::default();

    for id in registry.devices_with_capability(Capability::Hdf5Warmup) {
        let Some(plugin) = registry.get_hdf5_warmup(&id) else {
            continue;
        };
        let size = match plugin.array_size().await {
            Ok(size) => size,
            Err(e) => {
                warn!(device = %id, error = %e, "Could not read HDF5 array size");
                report.failed.push(id);
                continue;
            }
        };
        if !size.needs_warmup() {
            debug!(device = %id, size = %size, "HDF5 plugin already warm");
            report.skipped.push(id);
            continue;
        }
        match plugin.warmup().await {
            Ok(()) => {
                info!(device = %id, "Warmed up HDF5 plugin");
                report.warmed.push(id);
            }
            Err(e) => {
                warn!(device = %id, error = %e, "HDF5 warm-up failed");
                report.failed.push(id);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProposalPathProvider;
    use crate::registry::create_mock_registry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_warmup_runs_once() {
        let registry = create_mock_registry(Arc::new(ProposalPathProvider::mock("tst")))
            .await
            .unwrap();
        let first = warmup_hdf5_plugins(&registry).await;
        assert_eq!(first.warmed, vec!["manta1", "manta2"]);

        let second = warmup_hdf5_plugins(&registry).await;
        assert!(second.warmed.is_empty());
        assert_eq!(second.skipped, vec!["manta1", "manta2"]);
    }

    #[tokio::test]
    async fn test_sim_devices_have_no_connection_check() {
        let registry = create_mock_registry(Arc::new(ProposalPathProvider::mock("tst")))
            .await
            .unwrap();
        let report = validate_device_connections(&registry).await;
        assert_eq!(report.connected, vec!["manta1", "manta2", "panda1", "rot_motor"]);
        assert_eq!(report.errors, vec!["sim_det", "sim_motor"]);
        assert!(!report.all_connected());
    }
}
