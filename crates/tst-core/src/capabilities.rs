//! Atomic Device Capabilities
//!
//! Fine-grained traits a device handle can implement. The coordination core
//! and the run engine only ever talk to devices through these traits:
//!
//! - A Manta camera implements: `Stageable + Preparable + Flyable + Collectable + CaptureCount`
//! - A PandA trigger box implements: `Armable + CaptureChannels + SignalTree + ...`
//! - A rotation stage implements: `Movable + Preparable + Flyable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; state lives behind interior mutability
//! - Uses anyhow::Result for errors
//!
//! Capture-channel discovery is an explicit capability ([`CaptureChannels`])
//! rather than something found by probing a device's attributes.

use crate::document::DataKey;
use crate::trigger::PrepareInfo;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Signals
// =============================================================================

/// Value carried by a leaf signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer register.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Enum label or free text.
    Text(String),
}

impl SignalValue {
    /// Numeric view, if the value has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Int(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
            SignalValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            SignalValue::Text(s) => s.parse().ok(),
        }
    }

    /// Integer view, if the value has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SignalValue::Int(v) => Some(*v),
            SignalValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            SignalValue::Bool(v) => Some(i64::from(*v)),
            SignalValue::Text(s) => s.parse().ok(),
            SignalValue::Float(_) => None,
        }
    }
}

impl std::fmt::Display for SignalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalValue::Bool(v) => write!(f, "{}", v),
            SignalValue::Int(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{}", v),
            SignalValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Text(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        SignalValue::Text(value)
    }
}

impl From<i64> for SignalValue {
    fn from(value: i64) -> Self {
        SignalValue::Int(value)
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Float(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

/// A leaf signal on a device: one readable, writable value.
#[async_trait]
pub trait Signal: Send + Sync {
    /// Fully qualified name, e.g. `panda1-inenc1-val_capture`.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn get_value(&self) -> Result<SignalValue>;

    /// Write a new value.
    async fn set_value(&self, value: SignalValue) -> Result<()>;
}

/// A device that exposes its signals by dotted path (`pcomp1.start`).
pub trait SignalTree: Send + Sync {
    /// Look up a signal by path.
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>>;

    /// All known signal paths, sorted.
    fn signal_paths(&self) -> Vec<String>;
}

// =============================================================================
// Capture channels (trigger boxes)
// =============================================================================

/// Suffix marking a capture-enable selector signal.
pub const CAPTURE_SUFFIX: &str = "_capture";

/// Selector value meaning "do not capture this channel".
pub const CAPTURE_DISABLED: &str = "No";

/// A capture-enable selector on a trigger box.
#[derive(Clone)]
pub struct ChannelHandle {
    /// Selector name, always ending in [`CAPTURE_SUFFIX`].
    pub name: String,
    /// The selector signal itself.
    pub signal: Arc<dyn Signal>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle").field("name", &self.name).finish()
    }
}

/// Enumerates the capture-enable selectors of a device.
pub trait CaptureChannels: Send + Sync {
    /// Every selector, enabled or not.
    fn list_capture_channels(&self) -> Vec<ChannelHandle>;
}

/// Capability: gate arming (PandA `pcap.arm`).
#[async_trait]
pub trait Armable: Send + Sync {
    /// Set the gate-arm signal active.
    async fn arm(&self) -> Result<()>;

    /// Set the gate-arm signal inactive.
    async fn disarm(&self) -> Result<()>;

    /// Current arm state.
    async fn is_armed(&self) -> Result<bool>;
}

/// A trigger box: armable, with capture selectors.
pub trait TriggerBox: Armable + CaptureChannels {}

impl<T: Armable + CaptureChannels + ?Sized> TriggerBox for T {}

// =============================================================================
// Detector file writer
// =============================================================================

/// Capability: HDF writer capture counters.
#[async_trait]
pub trait CaptureCount: Send + Sync {
    /// Set how many frames the writer should capture.
    async fn set_num_capture(&self, count: u64) -> Result<()>;

    /// Currently requested capture count.
    async fn num_capture(&self) -> Result<u64>;

    /// Frames written so far.
    async fn num_captured(&self) -> Result<u64>;
}

/// Frame dimensions as seen by an HDF5 plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArraySize {
    /// Rows.
    pub height: u32,
    /// Columns.
    pub width: u32,
    /// Colour planes (0 for mono).
    pub depth: u32,
}

impl ArraySize {
    /// The plugin has not seen a frame since its IOC restarted.
    pub fn needs_warmup(&self) -> bool {
        self.height == 0 || self.width == 0
    }
}

impl std::fmt::Display for ArraySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.depth)
    }
}

/// Capability: HDF5 plugin warm-up.
///
/// The HDF5 plugin refuses to open a file until it has seen one frame and
/// learned its dimensions.
#[async_trait]
pub trait Hdf5Warmup: Send + Sync {
    /// Array dimensions currently known to the plugin.
    async fn array_size(&self) -> Result<ArraySize>;

    /// Push one frame through the plugin.
    async fn warmup(&self) -> Result<()>;
}

// =============================================================================
// Motion
// =============================================================================

/// Capability: Movable (positioners).
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to an absolute position and wait for it to settle.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current position.
    async fn position(&self) -> Result<f64>;

    /// Set the move velocity (units per second).
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Current move velocity.
    async fn velocity(&self) -> Result<f64>;
}

// =============================================================================
// Step-scan protocol
// =============================================================================

/// Capability: Readable.
///
/// Returns named values, keyed `<device>` or `<device>-<field>`.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read all values.
    async fn read(&self) -> Result<serde_json::Map<String, serde_json::Value>>;

    /// Schema for what `read` returns.
    async fn describe(&self) -> Result<Vec<(String, DataKey)>>;
}

/// Capability: Triggerable (software trigger for step scans).
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Acquire one point; returns once the value is ready to read.
    async fn trigger(&self) -> Result<()>;
}

/// Capability: Stageable.
///
/// Bluesky-style lifecycle hooks around a run.
#[async_trait]
pub trait Stageable: Send + Sync {
    /// Prepare for a run (open files, configure plugins).
    async fn stage(&self) -> Result<()>;

    /// Release resources after a run.
    async fn unstage(&self) -> Result<()>;

    /// Whether the device is currently staged.
    async fn is_staged(&self) -> Result<bool> {
        anyhow::bail!("Staged state query not supported by this device")
    }
}

// =============================================================================
// Fly-scan protocol
// =============================================================================

/// Capability: Preparable.
#[async_trait]
pub trait Preparable: Send + Sync {
    /// Configure the device for the next acquisition.
    async fn prepare(&self, info: PrepareInfo) -> Result<()>;
}

/// Capability: Flyable (device side of kickoff/complete).
#[async_trait]
pub trait Flyable: Send + Sync {
    /// Start the acquisition; returns once it is running.
    async fn kickoff(&self) -> Result<()>;

    /// Wait for the acquisition to finish.
    async fn complete(&self) -> Result<()>;
}

/// Reference to data a device wrote outside the document stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAsset {
    /// Data key the resource belongs to.
    pub data_key: String,
    /// File holding the data.
    pub uri: PathBuf,
    /// MIME type of the file.
    pub mimetype: String,
}

/// Result of one `collect` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedAssets {
    /// Frames (or rows) written so far.
    pub num_captured: u64,
    /// File the frames are in, once one is open.
    pub resource: Option<StreamAsset>,
}

/// Capability: Collectable.
#[async_trait]
pub trait Collectable: Send + Sync {
    /// Schema of the collected stream.
    async fn describe_collect(&self) -> Result<Vec<(String, DataKey)>>;

    /// Report what has been written since the acquisition started.
    async fn collect(&self) -> Result<CollectedAssets>;
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Capability: Connectable.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Whether the device answers. `Err` means the state could not be
    /// determined at all.
    async fn is_connected(&self) -> Result<bool>;
}
