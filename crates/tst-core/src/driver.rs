//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`] and are registered with the device
//! registry at startup via explicit `registry.register_factory(factory)`
//! calls. Each configured device is then built into a [`DeviceComponents`]
//! bag holding one trait object per capability it supports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Composition Root (tst-daq main)                │
//! │  registry.register_factory(MockPandaFactory);                   │
//! │  registry.register_factory(MockMantaFactory);                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry                           │
//! │  factories: driver_type -> Arc<dyn DriverFactory>               │
//! │  devices:   device_id   -> DeviceComponents                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::capabilities::{
    CaptureCount, Collectable, Connectable, Flyable, Hdf5Warmup, Movable, Preparable, Readable,
    SignalTree, Stageable, TriggerBox, Triggerable,
};
use crate::paths::PathProvider;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// [`crate::capabilities::Movable`]
    Movable,
    /// [`crate::capabilities::Readable`]
    Readable,
    /// [`crate::capabilities::Triggerable`]
    Triggerable,
    /// [`crate::capabilities::Stageable`]
    Stageable,
    /// [`crate::capabilities::Preparable`]
    Preparable,
    /// [`crate::capabilities::Flyable`]
    Flyable,
    /// [`crate::capabilities::Collectable`]
    Collectable,
    /// [`crate::capabilities::Armable`]
    Armable,
    /// [`crate::capabilities::CaptureChannels`]
    CaptureChannels,
    /// [`crate::capabilities::CaptureCount`]
    CaptureCount,
    /// [`crate::capabilities::SignalTree`]
    SignalTree,
    /// [`crate::capabilities::Connectable`]
    Connectable,
    /// [`crate::capabilities::Hdf5Warmup`]
    Hdf5Warmup,
}

impl Capability {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Movable => "Movable",
            Capability::Readable => "Readable",
            Capability::Triggerable => "Triggerable",
            Capability::Stageable => "Stageable",
            Capability::Preparable => "Preparable",
            Capability::Flyable => "Flyable",
            Capability::Collectable => "Collectable",
            Capability::Armable => "Armable",
            Capability::CaptureChannels => "Capture Channels",
            Capability::CaptureCount => "Capture Count",
            Capability::SignalTree => "Signal Tree",
            Capability::Connectable => "Connectable",
            Capability::Hdf5Warmup => "HDF5 Warmup",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Device category for grouping in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    /// Area detector (Manta).
    Detector,
    /// Position-compare / capture box (PandA).
    TriggerBox,
    /// Positioner.
    Motor,
    /// Simulated device for testing plans.
    Simulated,
}

// =============================================================================
// Device Components
// =============================================================================

/// Capability bag returned by a driver factory.
///
/// Drivers fill in only the capabilities they implement; often the same
/// `Arc` is handed to several slots.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    /// Device category for listings
    pub category: Option<DeviceCategory>,
    /// Movable implementation
    pub movable: Option<Arc<dyn Movable>>,
    /// Readable implementation
    pub readable: Option<Arc<dyn Readable>>,
    /// Triggerable implementation
    pub triggerable: Option<Arc<dyn Triggerable>>,
    /// Stageable implementation
    pub stageable: Option<Arc<dyn Stageable>>,
    /// Preparable implementation
    pub preparable: Option<Arc<dyn Preparable>>,
    /// Flyable implementation
    pub flyable: Option<Arc<dyn Flyable>>,
    /// Collectable implementation
    pub collectable: Option<Arc<dyn Collectable>>,
    /// Trigger box implementation (arm + capture channels)
    pub trigger_box: Option<Arc<dyn TriggerBox>>,
    /// HDF writer capture counters
    pub capture_count: Option<Arc<dyn CaptureCount>>,
    /// Signal lookup by path
    pub signals: Option<Arc<dyn SignalTree>>,
    /// Connection check
    pub connectable: Option<Arc<dyn Connectable>>,
    /// HDF5 warm-up
    pub hdf5_warmup: Option<Arc<dyn Hdf5Warmup>>,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.movable.is_some() {
            caps.push(Capability::Movable);
        }
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.stageable.is_some() {
            caps.push(Capability::Stageable);
        }
        if self.preparable.is_some() {
            caps.push(Capability::Preparable);
        }
        if self.flyable.is_some() {
            caps.push(Capability::Flyable);
        }
        if self.collectable.is_some() {
            caps.push(Capability::Collectable);
        }
        if self.trigger_box.is_some() {
            caps.push(Capability::Armable);
            caps.push(Capability::CaptureChannels);
        }
        if self.capture_count.is_some() {
            caps.push(Capability::CaptureCount);
        }
        if self.signals.is_some() {
            caps.push(Capability::SignalTree);
        }
        if self.connectable.is_some() {
            caps.push(Capability::Connectable);
        }
        if self.hdf5_warmup.is_some() {
            caps.push(Capability::Hdf5Warmup);
        }

        caps
    }

    // Builder methods

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set Movable implementation
    pub fn with_movable(mut self, m: Arc<dyn Movable>) -> Self {
        self.movable = Some(m);
        self
    }

    /// Set Readable implementation
    pub fn with_readable(mut self, r: Arc<dyn Readable>) -> Self {
        self.readable = Some(r);
        self
    }

    /// Set Triggerable implementation
    pub fn with_triggerable(mut self, t: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(t);
        self
    }

    /// Set Stageable implementation
    pub fn with_stageable(mut self, s: Arc<dyn Stageable>) -> Self {
        self.stageable = Some(s);
        self
    }

    /// Set Preparable implementation
    pub fn with_preparable(mut self, p: Arc<dyn Preparable>) -> Self {
        self.preparable = Some(p);
        self
    }

    /// Set Flyable implementation
    pub fn with_flyable(mut self, f: Arc<dyn Flyable>) -> Self {
        self.flyable = Some(f);
        self
    }

    /// Set Collectable implementation
    pub fn with_collectable(mut self, c: Arc<dyn Collectable>) -> Self {
        self.collectable = Some(c);
        self
    }

    /// Set trigger box implementation
    pub fn with_trigger_box(mut self, t: Arc<dyn TriggerBox>) -> Self {
        self.trigger_box = Some(t);
        self
    }

    /// Set capture counter implementation
    pub fn with_capture_count(mut self, c: Arc<dyn CaptureCount>) -> Self {
        self.capture_count = Some(c);
        self
    }

    /// Set signal tree implementation
    pub fn with_signals(mut self, s: Arc<dyn SignalTree>) -> Self {
        self.signals = Some(s);
        self
    }

    /// Set connection check implementation
    pub fn with_connectable(mut self, c: Arc<dyn Connectable>) -> Self {
        self.connectable = Some(c);
        self
    }

    /// Set HDF5 warm-up implementation
    pub fn with_hdf5_warmup(mut self, h: Arc<dyn Hdf5Warmup>) -> Self {
        self.hdf5_warmup = Some(h);
        self
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Read access to devices registered earlier, for drivers that wrap another
/// device (a simulated detector reading a simulated motor).
pub trait DeviceLookup: Send + Sync {
    /// Movable capability of device `id`, if registered.
    fn movable(&self, id: &str) -> Option<Arc<dyn Movable>>;
}

/// Everything a factory gets besides its own config table.
#[derive(Clone)]
pub struct BuildContext {
    /// Device id (also the device's name prefix for signals).
    pub id: String,
    /// Where the device should put its files.
    pub path_provider: Arc<dyn PathProvider>,
    /// Devices already in the registry.
    pub devices: Option<Arc<dyn DeviceLookup>>,
}

impl BuildContext {
    /// Context without access to other devices.
    pub fn new(id: impl Into<String>, path_provider: Arc<dyn PathProvider>) -> Self {
        Self {
            id: id.into(),
            path_provider,
            devices: None,
        }
    }

    /// Attach a device lookup.
    pub fn with_devices(mut self, devices: Arc<dyn DeviceLookup>) -> Self {
        self.devices = Some(devices);
        self
    }
}

/// Trait for driver factories that create device instances.
///
/// Factories are registered once at startup and live for the program's
/// lifetime, so they must be `Send + Sync + 'static`.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the config `driver` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver.
    fn build(
        &self,
        config: toml::Value,
        ctx: BuildContext,
    ) -> BoxFuture<'static, Result<DeviceComponents>>;
}
