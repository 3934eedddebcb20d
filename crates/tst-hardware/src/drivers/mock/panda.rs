//! Simulated PandA position-compare and capture box.
//!
//! Block layout follows the real device as far as the plans touch it:
//!
//! | path                         | meaning                                  |
//! |------------------------------|------------------------------------------|
//! | `pcap.arm`                   | capture gate arm                         |
//! | `pcomp1.{enable,start,step,pulses,width}` | position compare        |
//! | `clock1.{period,period_units,width,width_units}` | gate clock       |
//! | `data.num_captured`          | rows written by the capture block        |
//! | `<block>.<field>_capture`    | capture selectors (`No`, `Value`, ...)   |

use super::common::{ErrorConfig, MockMode};
use super::signal::SignalMap;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tst_core::capabilities::{
    Armable, CaptureChannels, ChannelHandle, CollectedAssets, Collectable, Connectable, Flyable,
    Preparable, Signal, SignalTree, SignalValue, Stageable, StreamAsset, CAPTURE_DISABLED,
};
use tst_core::document::DataKey;
use tst_core::paths::{PathInfo, PathProvider};
use tst_core::trigger::{PrepareInfo, TriggerInfo};

const DRIVER_TYPE: &str = "mock_panda";

/// Capture selectors of a freshly booted PandA.
pub fn default_captures() -> BTreeMap<String, String> {
    [
        ("inenc1.val_capture", "Mean"),
        ("inenc2.val_capture", "No"),
        ("calc1.out_capture", "Value"),
        ("counter1.out_capture", "No"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Default)]
struct PandaState {
    trigger_info: Option<TriggerInfo>,
    staged: bool,
    running: bool,
    resource: Option<PathInfo>,
}

/// Simulated PandA.
pub struct MockPanda {
    id: String,
    signals: SignalMap,
    mode: MockMode,
    errors: ErrorConfig,
    path_provider: Arc<dyn PathProvider>,
    state: Mutex<PandaState>,
}

impl MockPanda {
    /// PandA with the default capture selectors.
    pub fn new(id: &str, path_provider: Arc<dyn PathProvider>) -> Self {
        Self::with_options(id, path_provider, default_captures(), MockMode::Instant, ErrorConfig::none())
    }

    /// PandA with explicit capture selectors, timing mode and error injection.
    pub fn with_options(
        id: &str,
        path_provider: Arc<dyn PathProvider>,
        captures: BTreeMap<String, String>,
        mode: MockMode,
        errors: ErrorConfig,
    ) -> Self {
        let mut signals = SignalMap::new(id, DRIVER_TYPE, errors.clone());
        signals.add("pcap.arm", false);
        signals.add("pcomp1.enable", "ZERO");
        signals.add("pcomp1.start", 0i64);
        signals.add("pcomp1.step", 0i64);
        signals.add("pcomp1.pulses", 0i64);
        signals.add("pcomp1.width", 0i64);
        signals.add("clock1.period", 0.0);
        signals.add("clock1.period_units", "s");
        signals.add("clock1.width", 0.0);
        signals.add("clock1.width_units", "s");
        signals.add("data.num_captured", 0i64);
        for (path, value) in captures {
            signals.add(&path, value);
        }

        Self {
            id: id.to_string(),
            signals,
            mode,
            errors,
            path_provider,
            state: Mutex::new(PandaState::default()),
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

    /// Between kickoff and complete.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.errors.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    async fn set_arm(&self, armed: bool) -> Result<()> {
        let signal = self
            .signals
            .get("pcap.arm")
            .ok_or_else(|| anyhow!("{} has no pcap.arm", self.id))?;
        signal.set_value(SignalValue::Bool(armed)).await
    }

    fn enabled_captures(&self) -> Vec<String> {
        self.signals
            .capture_channels()
            .into_iter()
            .filter(|c| {
                self.signals
                    .peek(&c.name)
                    .map(|v| v.to_string() != CAPTURE_DISABLED)
                    .unwrap_or(false)
            })
            .map(|c| c.name)
            .collect()
    }
}

impl SignalTree for MockPanda {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.signal(path)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.signal_paths()
    }
}

impl CaptureChannels for MockPanda {
    fn list_capture_channels(&self) -> Vec<ChannelHandle> {
        self.signals.capture_channels()
    }
}

#[async_trait]
impl Armable for MockPanda {
    async fn arm(&self) -> Result<()> {
        self.set_arm(true).await
    }

    async fn disarm(&self) -> Result<()> {
        self.set_arm(false).await
    }

    async fn is_armed(&self) -> Result<bool> {
        self.check("get:pcap.arm")?;
        Ok(matches!(self.signals.peek("pcap.arm"), Some(SignalValue::Bool(true))))
    }
}

#[async_trait]
impl Stageable for MockPanda {
    async fn stage(&self) -> Result<()> {
        self.check("stage")?;
        let info = self.path_provider.path_info(&self.id)?;
        let mut state = self.state.lock();
        state.resource = Some(info);
        state.staged = true;
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        self.check("unstage")?;
        self.signals.poke("pcap.arm", false);
        let mut state = self.state.lock();
        state.staged = false;
        state.running = false;
        Ok(())
    }

    async fn is_staged(&self) -> Result<bool> {
        Ok(self.state.lock().staged)
    }
}

#[async_trait]
impl Preparable for MockPanda {
    async fn prepare(&self, info: PrepareInfo) -> Result<()> {
        self.check("prepare")?;
        let PrepareInfo::Trigger(info) = info else {
            bail!("{} cannot be prepared with a motor trajectory", self.id);
        };
        self.signals.poke("data.num_captured", 0i64);
        self.state.lock().trigger_info = Some(info);
        Ok(())
    }
}

#[async_trait]
impl Flyable for MockPanda {
    async fn kickoff(&self) -> Result<()> {
        self.check("kickoff")?;
        if self.state.lock().trigger_info.is_none() {
            bail!("{} kicked off before prepare", self.id);
        }
        self.set_arm(true).await?;
        self.state.lock().running = true;
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        self.check("complete")?;
        let info = self
            .state
            .lock()
            .trigger_info
            .ok_or_else(|| anyhow!("{} completed before prepare", self.id))?;
        self.mode.delay_secs(info.total_time).await;
        self.signals.poke("data.num_captured", info.count as i64);
        self.signals.poke("pcap.arm", false);
        self.state.lock().running = false;
        Ok(())
    }
}

#[async_trait]
impl Collectable for MockPanda {
    async fn describe_collect(&self) -> Result<Vec<(String, DataKey)>> {
        Ok(self
            .enabled_captures()
            .into_iter()
            .map(|path| {
                let field = path.trim_end_matches("_capture").replace('.', "-");
                let key = format!("{}-{}", self.id, field);
                (key, DataKey::external_array(&self.id, vec![]))
            })
            .collect())
    }

    async fn collect(&self) -> Result<CollectedAssets> {
        self.check("collect")?;
        let num_captured = self
            .signals
            .peek("data.num_captured")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as u64;
        let resource = self.state.lock().resource.as_ref().map(|info| StreamAsset {
            data_key: self.id.clone(),
            uri: info.file_path("h5"),
            mimetype: "application/x-hdf5".to_string(),
        });
        Ok(CollectedAssets {
            num_captured,
            resource,
        })
    }
}

#[async_trait]
impl Connectable for MockPanda {
    async fn is_connected(&self) -> Result<bool> {
        Ok(self.check("connect").is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProposalPathProvider;
    use tst_core::trigger::DetectorTrigger;

    fn panda() -> MockPanda {
        MockPanda::new("panda1", Arc::new(ProposalPathProvider::mock("tst")))
    }

    #[tokio::test]
    async fn test_capture_channels_listed() {
        let panda = panda();
        let names: Vec<String> = panda
            .list_capture_channels()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names.len(), 4);
        assert_eq!(panda.enabled_captures(), vec!["calc1.out_capture", "inenc1.val_capture"]);
    }

    #[tokio::test]
    async fn test_fly_cycle_updates_num_captured() {
        let panda = panda();
        let info = TriggerInfo::new(21, DetectorTrigger::ConstantGate, 0.001, 0.0009);
        panda.stage().await.unwrap();
        panda.prepare(info.into()).await.unwrap();
        panda.kickoff().await.unwrap();
        assert!(panda.is_armed().await.unwrap());
        assert!(panda.is_running());

        panda.complete().await.unwrap();
        assert!(!panda.is_armed().await.unwrap());

        let collected = panda.collect().await.unwrap();
        assert_eq!(collected.num_captured, 21);
        assert!(collected.resource.is_some());
    }

    #[tokio::test]
    async fn test_kickoff_requires_prepare() {
        let panda = panda();
        assert!(panda.kickoff().await.is_err());
    }

    #[tokio::test]
    async fn test_arm_failure_is_injected() {
        let panda = MockPanda::with_options(
            "panda1",
            Arc::new(ProposalPathProvider::mock("tst")),
            default_captures(),
            MockMode::Instant,
            ErrorConfig::failing("set:pcap.arm"),
        );
        assert!(panda.arm().await.is_err());
    }
}
