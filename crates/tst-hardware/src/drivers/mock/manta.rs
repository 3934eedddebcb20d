//! Simulated Manta area detector with an HDF5 file writer.

use super::common::{ErrorConfig, MockMode};
use super::signal::SignalMap;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tst_core::capabilities::{
    ArraySize, CaptureCount, CollectedAssets, Collectable, Connectable, Flyable, Hdf5Warmup,
    Preparable, Readable, Signal, SignalTree, SignalValue, Stageable, StreamAsset, Triggerable,
};
use tst_core::document::DataKey;
use tst_core::paths::{PathInfo, PathProvider};
use tst_core::trigger::{DetectorTrigger, PrepareInfo, TriggerInfo};

const DRIVER_TYPE: &str = "mock_manta";

/// Sensor size of the Manta G-235B.
pub const DEFAULT_RESOLUTION: (u32, u32) = (1936, 1216);

#[derive(Default)]
struct MantaState {
    trigger_info: Option<TriggerInfo>,
    staged: bool,
    resource: Option<PathInfo>,
}

/// Simulated Manta camera.
///
/// Signal paths: `cam.{acquire,acquire_time,acquire_period,trigger_mode,num_images}`,
/// `hdf.{num_capture,num_captured,capture,file_path,file_name}` and
/// `hdf.array_size_{height,width,depth}`. The array size starts at zero,
/// as after an IOC restart, until a frame goes through.
pub struct MockManta {
    id: String,
    resolution: (u32, u32),
    signals: SignalMap,
    mode: MockMode,
    errors: ErrorConfig,
    path_provider: Arc<dyn PathProvider>,
    state: Mutex<MantaState>,
}

impl MockManta {
    /// Manta with default resolution, instant timing and no injected errors.
    pub fn new(id: &str, path_provider: Arc<dyn PathProvider>) -> Self {
        Self::with_options(id, path_provider, DEFAULT_RESOLUTION, MockMode::Instant, ErrorConfig::none())
    }

    /// Manta with explicit resolution `(width, height)`, mode and error injection.
    pub fn with_options(
        id: &str,
        path_provider: Arc<dyn PathProvider>,
        resolution: (u32, u32),
        mode: MockMode,
        errors: ErrorConfig,
    ) -> Self {
        let mut signals = SignalMap::new(id, DRIVER_TYPE, errors.clone());
        signals.add("cam.acquire", false);
        signals.add("cam.acquire_time", 0.01);
        signals.add("cam.acquire_period", 0.1);
        signals.add("cam.trigger_mode", "Internal");
        signals.add("cam.num_images", 1i64);
        signals.add("hdf.num_capture", 0i64);
        signals.add("hdf.num_captured", 0i64);
        signals.add("hdf.capture", false);
        signals.add("hdf.file_path", "");
        signals.add("hdf.file_name", "");
        signals.add("hdf.array_size_height", 0i64);
        signals.add("hdf.array_size_width", 0i64);
        signals.add("hdf.array_size_depth", 0i64);

        Self {
            id: id.to_string(),
            resolution,
            signals,
            mode,
            errors,
            path_provider,
            state: Mutex::new(MantaState::default()),
        }
    }

    /// Device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Trigger info from the last `prepare`.
    pub fn trigger_info(&self) -> Option<TriggerInfo> {
        self.state.lock().trigger_info
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.errors.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    fn peek_u64(&self, path: &str) -> u64 {
        self.signals
            .peek(path)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as u64
    }

    fn frames_through_plugin(&self) {
        let (width, height) = self.resolution;
        self.signals.poke("hdf.array_size_height", i64::from(height));
        self.signals.poke("hdf.array_size_width", i64::from(width));
    }

    async fn write(&self, path: &str, value: impl Into<SignalValue>) -> Result<()> {
        let signal = self
            .signals
            .get(path)
            .ok_or_else(|| anyhow!("{} has no signal {}", self.id, path))?;
        signal.set_value(value.into()).await
    }
}

impl SignalTree for MockManta {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.signal(path)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.signal_paths()
    }
}

#[async_trait]
impl CaptureCount for MockManta {
    async fn set_num_capture(&self, count: u64) -> Result<()> {
        self.write("hdf.num_capture", count as i64).await
    }

    async fn num_capture(&self) -> Result<u64> {
        self.check("get:hdf.num_capture")?;
        Ok(self.peek_u64("hdf.num_capture"))
    }

    async fn num_captured(&self) -> Result<u64> {
        self.check("get:hdf.num_captured")?;
        Ok(self.peek_u64("hdf.num_captured"))
    }
}

#[async_trait]
impl Hdf5Warmup for MockManta {
    async fn array_size(&self) -> Result<ArraySize> {
        self.check("get:hdf.array_size")?;
        Ok(ArraySize {
            height: self.peek_u64("hdf.array_size_height") as u32,
            width: self.peek_u64("hdf.array_size_width") as u32,
            depth: self.peek_u64("hdf.array_size_depth") as u32,
        })
    }

    async fn warmup(&self) -> Result<()> {
        self.check("warmup")?;
        let exposure = self.signals.peek("cam.acquire_time").and_then(|v| v.as_f64());
        self.mode.delay_secs(exposure.unwrap_or(0.0)).await;
        self.frames_through_plugin();
        Ok(())
    }
}

#[async_trait]
impl Stageable for MockManta {
    async fn stage(&self) -> Result<()> {
        self.check("stage")?;
        let info = self.path_provider.path_info(&self.id)?;
        self.signals
            .poke("hdf.file_path", info.directory.display().to_string());
        self.signals.poke("hdf.file_name", info.filename.clone());
        self.signals.poke("hdf.num_captured", 0i64);
        self.signals.poke("hdf.capture", true);
        let mut state = self.state.lock();
        state.resource = Some(info);
        state.staged = true;
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        self.signals.poke("hdf.capture", false);
        self.signals.poke("cam.acquire", false);
        self.state.lock().staged = false;
        Ok(())
    }

    async fn is_staged(&self) -> Result<bool> {
        Ok(self.state.lock().staged)
    }
}

#[async_trait]
impl Preparable for MockManta {
    async fn prepare(&self, info: PrepareInfo) -> Result<()> {
        self.check("prepare")?;
        let PrepareInfo::Trigger(info) = info else {
            bail!("{} cannot be prepared with a motor trajectory", self.id);
        };
        let mode = match info.trigger {
            DetectorTrigger::Internal => "Internal",
            DetectorTrigger::EdgeTrigger => "Edge",
            DetectorTrigger::ConstantGate | DetectorTrigger::VariableGate => "Gate",
        };
        self.write("cam.trigger_mode", mode).await?;
        self.write("cam.acquire_time", info.livetime).await?;
        self.write("cam.acquire_period", info.deadtime.max(info.livetime)).await?;
        self.write("cam.num_images", info.count as i64).await?;
        self.state.lock().trigger_info = Some(info);
        Ok(())
    }
}

#[async_trait]
impl Flyable for MockManta {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        if self.state.lock().trigger_info.is_none() {
            bail!("{} kicked off before prepare", self.id);
        }
        self.write("cam.acquire", true).await
    }

    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        let info = self
            .state
            .lock()
            .trigger_info
            .ok_or_else(|| anyhow!("{} completed before prepare", self.id))?;
        self.mode.delay_secs(info.total_time).await;

        let requested = self.peek_u64("hdf.num_capture");
        let frames = if requested == 0 { info.count } else { info.count.min(requested) };
        self.signals.poke("hdf.num_captured", frames as i64);
        if frames > 0 {
            self.frames_through_plugin();
        }
        self.signals.poke("cam.acquire", false);
        Ok(())
    }
}

#[async_trait]
impl Collectable for MockManta {
    async fn describe_collect(&self) -> Result<Vec<(String, DataKey)>> {
        let (width, height) = self.resolution;
        Ok(vec![(
            self.id.clone(),
            DataKey::external_array(&self.id, vec![1, height as i32, width as i32]),
        )])
    }

    async fn collect(&self) -> Result<CollectedAssets> {
        self.check("collect")?;
        let resource = self.state.lock().resource.as_ref().map(|info| StreamAsset {
            data_key: self.id.clone(),
            uri: info.file_path("h5"),
            mimetype: "application/x-hdf5".to_string(),
        });
        Ok(CollectedAssets {
            num_captured: self.peek_u64("hdf.num_captured"),
            resource,
        })
    }
}

#[async_trait]
impl Triggerable for MockManta {
    async fn trigger(&self) -> Result<()> {
        self.check("trigger")?;
        let exposure = self.signals.peek("cam.acquire_time").and_then(|v| v.as_f64());
        self.mode.delay_secs(exposure.unwrap_or(0.0)).await;
        let frames = self.peek_u64("hdf.num_captured") + 1;
        self.signals.poke("hdf.num_captured", frames as i64);
        self.frames_through_plugin();
        Ok(())
    }
}

#[async_trait]
impl Readable for MockManta {
    async fn read(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.check("read")?;
        let mut values = serde_json::Map::new();
        values.insert(
            format!("{}-num_captured", self.id),
            serde_json::json!(self.peek_u64("hdf.num_captured")),
        );
        Ok(values)
    }

    async fn describe(&self) -> Result<Vec<(String, DataKey)>> {
        Ok(vec![(
            format!("{}-num_captured", self.id),
            DataKey::scalar(&self.id, "frames"),
        )])
    }
}

#[async_trait]
impl Connectable for MockManta {
    async fn is_connected(&self) -> Result<bool> {
        Ok(self.check("connect").is_ok())
    }
}
