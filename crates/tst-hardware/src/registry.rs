//! Device registry.
//!
//! The registry is built once at startup and handed around as
//! `Arc<DeviceRegistry>`. Driver factories are registered first, then
//! devices are built from configuration (or registered directly from
//! ready-made [`DeviceComponents`]), then plans look devices up by id and
//! capability.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::new(Arc::new(ProposalPathProvider::mock("tst")));
//! registry.register_factory(Arc::new(MockPandaFactory));
//! registry.register_from_config(&DeviceConfig {
//!     id: "panda1".into(),
//!     name: None,
//!     driver: "mock_panda".into(),
//!     config: toml::Value::Table(Default::default()),
//! }).await?;
//! let panda = registry.get_trigger_box("panda1");
//! ```

use crate::config::{DeviceConfig, InstrumentConfig};
use crate::drivers::mock::{
    MockMantaFactory, MockMotorFactory, MockPandaFactory, SimDetectorFactory, SimMotorFactory,
};
use crate::providers::ProposalPathProvider;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use tst_core::capabilities::{
    CaptureCount, Collectable, Connectable, Flyable, Hdf5Warmup, Movable, Preparable, Readable,
    SignalTree, Stageable, TriggerBox, Triggerable,
};
use tst_core::driver::{
    BuildContext, Capability, DeviceCategory, DeviceComponents, DeviceLookup, DriverFactory,
};
use tst_core::paths::PathProvider;

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The id is taken.
    #[error("Device '{0}' is already registered")]
    AlreadyRegistered(String),

    /// No factory for the requested driver type.
    #[error("Unknown driver type '{driver}' for device '{id}'")]
    UnknownDriver {
        /// Device id.
        id: String,
        /// Requested driver type.
        driver: String,
    },

    /// The factory rejected the device's config table.
    #[error("Configuration validation failed for device '{id}' ({driver}): {source}")]
    InvalidConfig {
        /// Device id.
        id: String,
        /// Driver type.
        driver: String,
        /// Factory's reason.
        #[source]
        source: anyhow::Error,
    },

    /// The factory failed to build the device.
    #[error("Failed to build device '{id}': {source}")]
    Build {
        /// Device id.
        id: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
}

/// Information about a registered device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Driver type that built it.
    pub driver_type: String,
    /// Category, when the driver declared one.
    pub category: Option<DeviceCategory>,
    /// Capabilities actually present.
    pub capabilities: Vec<Capability>,
}

#[derive(Clone)]
struct RegisteredDevice {
    info: DeviceInfo,
    components: DeviceComponents,
}

type DeviceMap = Arc<DashMap<String, RegisteredDevice>>;

struct RegistryLookup {
    devices: DeviceMap,
}

impl DeviceLookup for RegistryLookup {
    fn movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.devices.get(id).and_then(|d| d.components.movable.clone())
    }
}

/// Central registry of devices and the factories that build them.
pub struct DeviceRegistry {
    devices: DeviceMap,
    factories: DashMap<String, Arc<dyn DriverFactory>>,
    path_provider: Arc<dyn PathProvider>,
}

impl DeviceRegistry {
    /// Empty registry whose devices write through `path_provider`.
    pub fn new(path_provider: Arc<dyn PathProvider>) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            factories: DashMap::new(),
            path_provider,
        }
    }

    /// Registry with every mock factory registered and no devices.
    pub fn with_mock_factories(path_provider: Arc<dyn PathProvider>) -> Self {
        let registry = Self::new(path_provider);
        registry.register_factory(Arc::new(MockMantaFactory));
        registry.register_factory(Arc::new(MockPandaFactory));
        registry.register_factory(Arc::new(MockMotorFactory));
        registry.register_factory(Arc::new(SimMotorFactory));
        registry.register_factory(Arc::new(SimDetectorFactory));
        registry
    }

    /// Build the registry an [`InstrumentConfig`] describes.
    ///
    /// Configured devices are built in order. With no devices configured
    /// and mock mode on, the standard mock instrument is built instead.
    pub async fn from_config(config: &InstrumentConfig) -> Result<Self, RegistryError> {
        let provider = Arc::new(ProposalPathProvider::from_config(
            config.mock_mode,
            &config.acronym(),
            &config.paths,
        ));
        let registry = Self::with_mock_factories(provider);
        if config.devices.is_empty() && config.mock_mode {
            registry.populate_mock_instrument().await?;
        } else {
            for device in &config.devices {
                registry.register_from_config(device).await?;
            }
        }
        Ok(registry)
    }

    /// Register a factory, replacing any with the same driver type.
    pub fn register_factory(&self, factory: Arc<dyn DriverFactory>) {
        debug!(driver = factory.driver_type(), "Registered driver factory");
        self.factories
            .insert(factory.driver_type().to_string(), factory);
    }

    /// Driver types with a registered factory, sorted.
    pub fn driver_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|f| f.key().clone()).collect();
        types.sort();
        types
    }

    /// Path provider handed to device factories.
    pub fn path_provider(&self) -> Arc<dyn PathProvider> {
        self.path_provider.clone()
    }

    /// Register ready-made components under `id`.
    pub fn register(
        &self,
        id: &str,
        name: &str,
        driver_type: &str,
        components: DeviceComponents,
    ) -> Result<(), RegistryError> {
        let info = DeviceInfo {
            id: id.to_string(),
            name: name.to_string(),
            driver_type: driver_type.to_string(),
            category: components.category,
            capabilities: components.capabilities(),
        };
        match self.devices.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyRegistered(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(device = %id, driver = %driver_type, "Registered device");
                slot.insert(RegisteredDevice { info, components });
                Ok(())
            }
        }
    }

    /// Build a device through its factory and register it.
    pub async fn register_from_config(&self, config: &DeviceConfig) -> Result<(), RegistryError> {
        if self.contains(&config.id) {
            return Err(RegistryError::AlreadyRegistered(config.id.clone()));
        }
        let factory = self
            .factories
            .get(&config.driver)
            .map(|f| f.value().clone())
            .ok_or_else(|| RegistryError::UnknownDriver {
                id: config.id.clone(),
                driver: config.driver.clone(),
            })?;

        factory
            .validate(&config.config)
            .map_err(|source| RegistryError::InvalidConfig {
                id: config.id.clone(),
                driver: config.driver.clone(),
                source,
            })?;

        let ctx = BuildContext::new(config.id.clone(), self.path_provider.clone()).with_devices(
            Arc::new(RegistryLookup {
                devices: self.devices.clone(),
            }),
        );
        let components = factory
            .build(config.config.clone(), ctx)
            .await
            .map_err(|source| RegistryError::Build {
                id: config.id.clone(),
                source,
            })?;

        let name = config.name.clone().unwrap_or_else(|| config.id.clone());
        self.register(&config.id, &name, &config.driver, components)
    }

    /// Parse `[[devices]]` tables from TOML and register each.
    pub async fn register_from_toml(&self, content: &str) -> anyhow::Result<usize> {
        #[derive(serde::Deserialize)]
        struct DeviceList {
            #[serde(default)]
            devices: Vec<DeviceConfig>,
        }
        let list: DeviceList = toml::from_str(content)?;
        for device in &list.devices {
            self.register_from_config(device).await?;
        }
        Ok(list.devices.len())
    }

    /// Remove a device. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// No devices registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All devices, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.devices.iter().map(|d| d.info.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Info for one device.
    pub fn get_device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.get(id).map(|d| d.info.clone())
    }

    /// Ids of devices that have `capability`, sorted.
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.info.capabilities.contains(&capability))
            .map(|d| d.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop every device. Factories stay registered.
    pub fn clear(&self) {
        self.devices.clear();
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Whole capability bag of a device.
    pub fn get_components(&self, id: &str) -> Option<DeviceComponents> {
        self.devices.get(id).map(|d| d.components.clone())
    }

    /// Get a device as Movable.
    pub fn get_movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.devices.get(id).and_then(|d| d.components.movable.clone())
    }

    /// Get a device as Readable.
    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.devices.get(id).and_then(|d| d.components.readable.clone())
    }

    /// Get a device as Triggerable.
    pub fn get_triggerable(&self, id: &str) -> Option<Arc<dyn Triggerable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.triggerable.clone())
    }

    /// Get a device as Stageable.
    pub fn get_stageable(&self, id: &str) -> Option<Arc<dyn Stageable>> {
        self.devices.get(id).and_then(|d| d.components.stageable.clone())
    }

    /// Get a device as Preparable.
    pub fn get_preparable(&self, id: &str) -> Option<Arc<dyn Preparable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.preparable.clone())
    }

    /// Get a device as Flyable.
    pub fn get_flyable(&self, id: &str) -> Option<Arc<dyn Flyable>> {
        self.devices.get(id).and_then(|d| d.components.flyable.clone())
    }

    /// Get a device as Collectable.
    pub fn get_collectable(&self, id: &str) -> Option<Arc<dyn Collectable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.collectable.clone())
    }

    /// Get a device as a trigger box (arm + capture channels).
    pub fn get_trigger_box(&self, id: &str) -> Option<Arc<dyn TriggerBox>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.trigger_box.clone())
    }

    /// Get a detector's HDF writer counters.
    pub fn get_capture_count(&self, id: &str) -> Option<Arc<dyn CaptureCount>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.capture_count.clone())
    }

    /// Get a device's signal tree.
    pub fn get_signals(&self, id: &str) -> Option<Arc<dyn SignalTree>> {
        self.devices.get(id).and_then(|d| d.components.signals.clone())
    }

    /// Get a device's connection check.
    pub fn get_connectable(&self, id: &str) -> Option<Arc<dyn Connectable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.connectable.clone())
    }

    /// Get a device's HDF5 warm-up.
    pub fn get_hdf5_warmup(&self, id: &str) -> Option<Arc<dyn Hdf5Warmup>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.hdf5_warmup.clone())
    }

    async fn populate_mock_instrument(&self) -> Result<(), RegistryError> {
        for device in mock_instrument_devices() {
            self.register_from_config(&device).await?;
        }
        info!(devices = self.len(), "Mock instrument ready");
        Ok(())
    }
}

/// Device ids of the standard mock instrument.
pub const MOCK_DEVICE_IDS: [&str; 6] = [
    "manta1",
    "manta2",
    "panda1",
    "rot_motor",
    "sim_motor",
    "sim_det",
];

fn mock_instrument_devices() -> Vec<DeviceConfig> {
    let device = |id: &str, name: &str, driver: &str| DeviceConfig {
        id: id.to_string(),
        name: Some(name.to_string()),
        driver: driver.to_string(),
        config: toml::Value::Table(toml::map::Map::new()),
    };
    // sim_det looks up sim_motor while building, so order matters.
    vec![
        device("manta1", "Manta detector 1", "mock_manta"),
        device("manta2", "Manta detector 2", "mock_manta"),
        device("panda1", "PandA trigger box", "mock_panda"),
        device("rot_motor", "Rotation stage", "mock_motor"),
        device("sim_motor", "Simulated motor", "sim_motor"),
        device("sim_det", "Simulated detector", "sim_detector"),
    ]
}

/// Registry holding the standard mock instrument.
pub async fn create_mock_registry(
    path_provider: Arc<dyn PathProvider>,
) -> Result<DeviceRegistry, RegistryError> {
    let registry = DeviceRegistry::with_mock_factories(path_provider);
    registry.populate_mock_instrument().await?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<dyn PathProvider> {
        Arc::new(ProposalPathProvider::mock("tst"))
    }

    #[tokio::test]
    async fn test_mock_registry_contents() {
        let registry = create_mock_registry(provider()).await.unwrap();
        assert_eq!(registry.len(), MOCK_DEVICE_IDS.len());
        for id in MOCK_DEVICE_IDS {
            assert!(registry.contains(id), "missing {id}");
        }
        assert!(registry.get_trigger_box("panda1").is_some());
        assert!(registry.get_capture_count("manta2").is_some());
        assert!(registry.get_movable("rot_motor").is_some());
        assert!(registry.get_triggerable("sim_det").is_some());
        assert!(registry.get_trigger_box("manta1").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = DeviceRegistry::new(provider());
        registry
            .register("x", "X", "custom", DeviceComponents::new())
            .unwrap();
        let again = registry.register("x", "X", "custom", DeviceComponents::new());
        assert!(matches!(again, Err(RegistryError::AlreadyRegistered(id)) if id == "x"));
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let registry = DeviceRegistry::with_mock_factories(provider());
        let result = registry
            .register_from_config(&DeviceConfig {
                id: "cam".into(),
                name: None,
                driver: "eiger".into(),
                config: toml::Value::Table(Default::default()),
            })
            .await;
        assert!(matches!(result, Err(RegistryError::UnknownDriver { .. })));
    }

    #[tokio::test]
    async fn test_capability_query_and_clear() {
        let registry = create_mock_registry(provider()).await.unwrap();
        assert_eq!(
            registry.devices_with_capability(Capability::CaptureCount),
            vec!["manta1", "manta2"]
        );
        assert!(registry.unregister("manta2"));
        assert!(!registry.unregister("manta2"));
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.driver_types().len(), 5);
    }
}
