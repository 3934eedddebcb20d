//! Build flyers and coordinators from registered devices.

use super::coordinator::FlyerCoordinator;
use super::flyer::DeviceFlyer;
use super::trigger_logic::TriggerSettings;
use tracing::info;
use tst_core::error::{FlyError, FlyResult};
use tst_hardware::config::CoordinationConfig;
use tst_hardware::DeviceRegistry;

/// The standard flyer trio of the instrument.
#[derive(Debug)]
pub struct StandardFlyers {
    /// Timing-only flyer.
    pub default_flyer: DeviceFlyer,
    /// Flyer over the area detector.
    pub manta_flyer: DeviceFlyer,
    /// Flyer over the trigger box.
    pub panda_flyer: DeviceFlyer,
}

/// Manta flyer over registered device `detector`.
pub fn manta_flyer(
    registry: &DeviceRegistry,
    name: &str,
    detector: &str,
    settings: TriggerSettings,
) -> FlyResult<DeviceFlyer> {
    if !registry.contains(detector) {
        return Err(FlyError::DeviceNotFound(detector.to_string()));
    }
    let counts = registry
        .get_capture_count(detector)
        .ok_or_else(|| FlyError::MissingCapability {
            device: detector.to_string(),
            capability: "CaptureCount",
        })?;
    Ok(DeviceFlyer::manta(name, detector, counts).with_settings(settings))
}

/// PandA flyer over registered device `panda`.
pub fn panda_flyer(
    registry: &DeviceRegistry,
    name: &str,
    panda: &str,
    settings: TriggerSettings,
) -> FlyResult<DeviceFlyer> {
    if !registry.contains(panda) {
        return Err(FlyError::DeviceNotFound(panda.to_string()));
    }
    let trigger_box = registry
        .get_trigger_box(panda)
        .ok_or_else(|| FlyError::MissingCapability {
            device: panda.to_string(),
            capability: "TriggerBox",
        })?;
    Ok(DeviceFlyer::panda(name, panda, trigger_box).with_settings(settings))
}

/// `default_flyer`, `manta_flyer` and `panda_flyer` over `detector` and `panda`.
pub fn create_flyers(
    registry: &DeviceRegistry,
    detector: &str,
    panda: &str,
    settings: TriggerSettings,
) -> FlyResult<StandardFlyers> {
    let flyers = StandardFlyers {
        default_flyer: DeviceFlyer::generic("default_flyer").with_settings(settings),
        manta_flyer: manta_flyer(registry, "manta_flyer", detector, settings)?,
        panda_flyer: panda_flyer(registry, "panda_flyer", panda, settings)?,
    };
    info!(detector, panda, "Created TST flyers");
    Ok(flyers)
}

/// Coordinator with a `manta_<i>` flyer per detector and a `panda` flyer.
pub fn create_advanced_flyer_coordinator(
    registry: &DeviceRegistry,
    detectors: &[&str],
    panda: &str,
    config: &CoordinationConfig,
) -> FlyResult<FlyerCoordinator> {
    let settings = TriggerSettings::from(config);
    let mut coordinator = FlyerCoordinator::from_config("tst_flyer_coordinator", config);

    for (i, detector) in detectors.iter().enumerate() {
        let name = format!("manta_{}", i);
        let flyer = manta_flyer(registry, &format!("{}_flyer", detector), detector, settings)?;
        coordinator.add_flyer(name, Box::new(flyer));
    }
    coordinator.add_flyer("panda", Box::new(panda_flyer(registry, "panda_flyer", panda, settings)?));

    info!(flyers = coordinator.len(), "Created advanced flyer coordinator");
    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flyers::flyer::Flyer;
    use std::sync::Arc;
    use tst_hardware::{create_mock_registry, ProposalPathProvider};

    async fn registry() -> DeviceRegistry {
        create_mock_registry(Arc::new(ProposalPathProvider::mock("tst")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_standard_trio() {
        let registry = registry().await;
        let flyers = create_flyers(&registry, "manta1", "panda1", TriggerSettings::default()).unwrap();
        assert_eq!(flyers.default_flyer.name(), "default_flyer");
        assert_eq!(flyers.manta_flyer.device(), "manta1");
        assert_eq!(flyers.panda_flyer.kind().label(), "panda");
    }

    #[tokio::test]
    async fn test_missing_device() {
        let registry = registry().await;
        let err = create_flyers(&registry, "manta9", "panda1", TriggerSettings::default()).unwrap_err();
        assert!(matches!(err, FlyError::DeviceNotFound(id) if id == "manta9"));
    }

    #[tokio::test]
    async fn test_wrong_capability() {
        let registry = registry().await;
        let err = create_flyers(&registry, "manta1", "rot_motor", TriggerSettings::default())
            .unwrap_err();
        assert!(matches!(
            err,
            FlyError::MissingCapability { capability: "TriggerBox", .. }
        ));
    }

    #[tokio::test]
    async fn test_advanced_coordinator_names() {
        let registry = registry().await;
        let coordinator = create_advanced_flyer_coordinator(
            &registry,
            &["manta1", "manta2"],
            "panda1",
            &CoordinationConfig::default(),
        )
        .unwrap();
        assert_eq!(coordinator.flyer_names(), vec!["manta_0", "manta_1", "panda"]);
    }
}
