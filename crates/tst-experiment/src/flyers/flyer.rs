//! Device flyers.
//!
//! A [`DeviceFlyer`] binds one [`TriggerLogic`] to one hardware endpoint and
//! maps the three-phase protocol onto the endpoint's native commands. The
//! endpoint kind is a closed sum type rather than one flyer type per
//! device family.

use super::trigger_logic::{TriggerLogic, TriggerSettings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tst_core::capabilities::{CaptureCount, ChannelHandle, TriggerBox, CAPTURE_DISABLED};
use tst_core::error::{FlyError, FlyResult};
use tst_core::trigger::{TimingParams, TriggerInfo, TriggerState};

/// Settle time after disarming the PandA capture gate.
const DISARM_SETTLE: Duration = Duration::from_millis(10);

/// A coordination wrapper driving one acquisition stream through
/// prepare → kickoff → complete.
///
/// Flyers are exclusively owned by their caller, so every phase takes
/// `&mut self`.
#[async_trait]
pub trait Flyer: Send + Sync {
    /// Flyer name used in logs.
    fn name(&self) -> &str;

    /// Lifecycle state.
    fn state(&self) -> TriggerState;

    /// Bind a point count and configure the device.
    async fn prepare(&mut self, point_count: i64) -> FlyResult<()>;

    /// Start the acquisition.
    async fn kickoff(&mut self) -> FlyResult<()>;

    /// Stop the acquisition and clear per-acquisition state.
    async fn complete(&mut self) -> FlyResult<()>;

    /// Timing of the last successful prepare.
    fn trigger_info(&self) -> Option<TriggerInfo> {
        None
    }

    /// Timing handed to the timing validator.
    fn timing_params(&self) -> Option<TimingParams> {
        self.trigger_info().as_ref().map(TimingParams::from)
    }
}

/// Hardware endpoint a [`DeviceFlyer`] drives.
#[derive(Clone)]
pub enum FlyerKind {
    /// Area detector; prepare sets the HDF writer capture count.
    Manta {
        /// Capture counters of the detector's file writer.
        detector: Arc<dyn CaptureCount>,
    },
    /// Trigger box; prepare discovers enabled captures and disarms,
    /// kickoff arms, complete disarms.
    Panda {
        /// Gate and capture selectors.
        trigger_box: Arc<dyn TriggerBox>,
    },
    /// Timing only.
    Generic,
}

impl FlyerKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            FlyerKind::Manta { .. } => "manta",
            FlyerKind::Panda { .. } => "panda",
            FlyerKind::Generic => "generic",
        }
    }
}

impl std::fmt::Debug for FlyerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Flyer over one device.
#[derive(Debug)]
pub struct DeviceFlyer {
    name: String,
    device: String,
    kind: FlyerKind,
    logic: TriggerLogic,
    selected_captures: Vec<ChannelHandle>,
}

impl DeviceFlyer {
    /// Flyer of any kind.
    pub fn new(
        name: impl Into<String>,
        device: impl Into<String>,
        kind: FlyerKind,
        settings: TriggerSettings,
    ) -> Self {
        let name = name.into();
        Self {
            logic: TriggerLogic::with_settings(format!("{}_trigger_logic", name), settings),
            name,
            device: device.into(),
            kind,
            selected_captures: Vec::new(),
        }
    }

    /// Flyer over a Manta detector.
    pub fn manta(
        name: impl Into<String>,
        device: impl Into<String>,
        detector: Arc<dyn CaptureCount>,
    ) -> Self {
        Self::new(name, device, FlyerKind::Manta { detector }, TriggerSettings::default())
    }

    /// Flyer over a PandA trigger box.
    pub fn panda(
        name: impl Into<String>,
        device: impl Into<String>,
        trigger_box: Arc<dyn TriggerBox>,
    ) -> Self {
        Self::new(name, device, FlyerKind::Panda { trigger_box }, TriggerSettings::default())
    }

    /// Timing-only flyer.
    pub fn generic(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name, FlyerKind::Generic, TriggerSettings::default())
    }

    /// Replace the trigger logic settings.
    pub fn with_settings(mut self, settings: TriggerSettings) -> Self {
        self.logic = TriggerLogic::with_settings(self.logic.name().to_string(), settings);
        self
    }

    /// Device id the flyer drives.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Endpoint kind.
    pub fn kind(&self) -> &FlyerKind {
        &self.kind
    }

    /// Trigger logic, for inspection.
    pub fn logic(&self) -> &TriggerLogic {
        &self.logic
    }

    /// Capture selectors found enabled by the last prepare.
    pub fn selected_captures(&self) -> Vec<String> {
        self.selected_captures.iter().map(|c| c.name.clone()).collect()
    }

    fn device_failure(
        &mut self,
        signal: &str,
        operation: &'static str,
        source: anyhow::Error,
    ) -> FlyError {
        self.logic.fail();
        let device = format!("{}.{}", self.device, signal);
        error!(
            flyer = %self.name,
            device = %device,
            operation,
            error = %source,
            "Flyer device call failed"
        );
        FlyError::device(device, operation, source)
    }

    /// Capture selectors whose value is not `No`.
    ///
    /// A selector that cannot be read is logged and skipped.
    async fn find_selected_captures(&self, trigger_box: &dyn TriggerBox) -> Vec<ChannelHandle> {
        let mut selected = Vec::new();
        for channel in trigger_box.list_capture_channels() {
            match channel.signal.get_value().await {
                Ok(value) if value.to_string() != CAPTURE_DISABLED => {
                    debug!(flyer = %self.name, channel = %channel.name, value = %value, "Found capture signal");
                    selected.push(channel);
                }
                Ok(_) => {}
                Err(e) => warn!(
                    flyer = %self.name,
                    channel = %channel.name,
                    error = %e,
                    "Could not read capture signal, skipping"
                ),
            }
        }
        selected
    }
}

#[async_trait]
impl Flyer for DeviceFlyer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> TriggerState {
        self.logic.state()
    }

    async fn prepare(&mut self, point_count: i64) -> FlyResult<()> {
        info!(flyer = %self.name, kind = self.kind.label(), points = point_count, "Preparing flyer");
        let info = self.logic.prepare(point_count).await?;

        match self.kind.clone() {
            FlyerKind::Manta { detector } => {
                if let Err(e) = detector.set_num_capture(info.count).await {
                    return Err(self.device_failure("hdf.num_capture", "prepare", e));
                }
                debug!(flyer = %self.name, count = info.count, "Set detector capture count");
            }
            FlyerKind::Panda { trigger_box } => {
                self.selected_captures = self.find_selected_captures(trigger_box.as_ref()).await;
                info!(
                    flyer = %self.name,
                    captures = self.selected_captures.len(),
                    "Found capture signals"
                );
                if let Err(e) = trigger_box.disarm().await {
                    return Err(self.device_failure("pcap.arm", "prepare", e));
                }
                tokio::time::sleep(DISARM_SETTLE).await;
            }
            FlyerKind::Generic => {}
        }

        info!(flyer = %self.name, points = info.count, "Flyer preparation complete");
        Ok(())
    }

    async fn kickoff(&mut self) -> FlyResult<()> {
        if self.logic.prepared_count().is_none() {
            return Err(FlyError::NotPrepared(self.name.clone()));
        }
        info!(flyer = %self.name, "Starting acquisition sequence");
        self.logic.start()?;

        if let FlyerKind::Panda { trigger_box } = self.kind.clone() {
            if let Err(e) = trigger_box.arm().await {
                return Err(self.device_failure("pcap.arm", "kickoff", e));
            }
            debug!(flyer = %self.name, "PandA armed for capture");
        }
        Ok(())
    }

    async fn complete(&mut self) -> FlyResult<()> {
        info!(flyer = %self.name, "Completing acquisition");

        if let FlyerKind::Panda { trigger_box } = self.kind.clone() {
            if let Err(e) = trigger_box.disarm().await {
                self.selected_captures.clear();
                return Err(self.device_failure("pcap.arm", "complete", e));
            }
            debug!(flyer = %self.name, "PandA disarmed");
        }

        self.logic.stop().await;
        self.selected_captures.clear();
        info!(flyer = %self.name, "Flyer acquisition complete");
        Ok(())
    }

    fn trigger_info(&self) -> Option<TriggerInfo> {
        self.logic.trigger_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use tst_hardware::drivers::mock::{ErrorConfig, MockManta, MockMode, MockPanda};
    use tst_hardware::drivers::mock::panda::default_captures;
    use tst_hardware::ProposalPathProvider;
    use tst_core::capabilities::Armable;

    fn provider() -> Arc<ProposalPathProvider> {
        Arc::new(ProposalPathProvider::mock("tst"))
    }

    fn quick() -> TriggerSettings {
        TriggerSettings {
            prepare_settle: Duration::ZERO,
            stop_settle: Duration::ZERO,
            ..TriggerSettings::default()
        }
    }

    fn panda_with(errors: ErrorConfig) -> Arc<MockPanda> {
        Arc::new(MockPanda::with_options(
            "panda1",
            provider(),
            default_captures(),
            MockMode::Instant,
            errors,
        ))
    }

    #[tokio::test]
    async fn test_kickoff_without_prepare() {
        let mut flyer = DeviceFlyer::generic("default_flyer");
        assert!(matches!(
            flyer.kickoff().await,
            Err(FlyError::NotPrepared(name)) if name == "default_flyer"
        ));
    }

    #[tokio::test]
    async fn test_manta_prepare_sets_num_capture() {
        let manta = Arc::new(MockManta::new("manta1", provider()));
        let mut flyer =
            DeviceFlyer::manta("manta_flyer", "manta1", manta.clone()).with_settings(quick());

        flyer.prepare(21).await.unwrap();
        assert_eq!(manta.num_capture().await.unwrap(), 21);
        assert_eq!(flyer.timing_params().map(|t| t.num_triggers), Some(21));

        flyer.kickoff().await.unwrap();
        assert_eq!(flyer.state(), TriggerState::Starting);
        flyer.complete().await.unwrap();
        assert_eq!(flyer.state(), TriggerState::Complete);

        // Reusable for a second acquisition.
        flyer.prepare(5).await.unwrap();
        assert_eq!(manta.num_capture().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_panda_cycle_arms_and_disarms() {
        let panda = panda_with(ErrorConfig::none());
        let mut flyer =
            DeviceFlyer::panda("panda_flyer", "panda1", panda.clone()).with_settings(quick());

        flyer.prepare(10).await.unwrap();
        assert_eq!(
            flyer.selected_captures(),
            vec!["calc1.out_capture", "inenc1.val_capture"]
        );
        assert!(!panda.is_armed().await.unwrap());

        flyer.kickoff().await.unwrap();
        assert!(panda.is_armed().await.unwrap());

        flyer.complete().await.unwrap();
        assert!(!panda.is_armed().await.unwrap());
        assert!(flyer.selected_captures().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreadable_capture_is_skipped() {
        let panda = panda_with(ErrorConfig::failing("get:inenc1.val_capture"));
        let mut flyer = DeviceFlyer::panda("panda_flyer", "panda1", panda).with_settings(quick());

        flyer.prepare(10).await.unwrap();
        assert_eq!(flyer.selected_captures(), vec!["calc1.out_capture"]);
        assert!(logs_contain("Could not read capture signal"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_arm_failure_propagates() {
        let panda = panda_with(ErrorConfig::failing("set:pcap.arm"));
        let mut flyer = DeviceFlyer::panda("panda_flyer", "panda1", panda).with_settings(quick());

        // Disarm in prepare writes the same signal.
        let err = flyer.prepare(10).await.unwrap_err();
        match err {
            FlyError::DeviceCommunication { device, operation, .. } => {
                assert_eq!(device, "panda1.pcap.arm");
                assert_eq!(operation, "prepare");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(flyer.state(), TriggerState::Error);
        assert!(logs_contain("Flyer device call failed"));
    }

    #[tokio::test]
    async fn test_invalid_count_fails_prepare() {
        let mut flyer = DeviceFlyer::generic("g").with_settings(quick());
        assert!(matches!(
            flyer.prepare(0).await,
            Err(FlyError::InvalidArgument(_))
        ));
        assert!(matches!(flyer.kickoff().await, Err(FlyError::NotPrepared(_))));
    }
}
