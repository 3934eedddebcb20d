//! RunEngine - executes acquisition plans and emits documents.
//!
//! The engine owns a plan queue and a document broadcast channel. Each plan
//! runs against a [`RunContext`], which implements the plan protocol
//! (open/close run, stage, prepare/kickoff/complete into status groups,
//! bounded waits, stream declaration and collection) on top of the device
//! registry.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │
//!    │  completed           │ pause() at checkpoint
//!    │                      ▼
//!    │                 ┌────────┐
//!    │◀────resume()────│ Paused │
//!    │                 └────────┘
//!    │
//!    │  abort()
//!    └────────────────────────────
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new(registry);
//! let mut docs = engine.subscribe();
//!
//! engine.queue(Box::new(SimCount::new(3))).await;
//! let outcome = engine.start().await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::plans::Plan;
use tst_core::capabilities::SignalValue;
use tst_core::document::{
    new_uid, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc, StreamResourceDoc,
};
use tst_core::status::{PollOutcome, StatusGroup};
use tst_core::trigger::PrepareInfo;
use tst_hardware::DeviceRegistry;

/// Poll interval used by [`RunContext::wait_for`] and while paused.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No plan running, ready to accept new plans
    Idle,
    /// Executing a plan
    Running,
    /// Paused at a checkpoint, can resume or abort
    Paused,
    /// Aborting current plan (will return to Idle)
    Aborting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Aborting => write!(f, "aborting"),
        }
    }
}

/// Plan protocol failures raised by the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operator aborted the plan.
    #[error("Plan aborted: {0}")]
    Aborted(String),

    /// A run document was requested with no open run.
    #[error("No open run")]
    NoOpenRun,

    /// `open_run` was called twice.
    #[error("Run {0} is already open")]
    RunAlreadyOpen(String),

    /// The device is missing or lacks the capability the step needs.
    #[error("Device '{device}' does not provide {capability}")]
    Capability {
        /// Device id.
        device: String,
        /// Capability name.
        capability: &'static str,
    },

    /// The device has no signal at the path.
    #[error("Device '{device}' has no signal '{path}'")]
    UnknownSignal {
        /// Device id.
        device: String,
        /// Dotted signal path.
        path: String,
    },
}

/// How a run or plan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Finished normally.
    Success,
    /// Stopped on operator request.
    Abort(String),
    /// Failed.
    Fail(String),
}

impl ExitStatus {
    /// Stop document tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Abort(_) => "abort",
            ExitStatus::Fail(_) => "fail",
        }
    }

    /// Finished normally.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Success => f.write_str("success"),
            ExitStatus::Abort(reason) | ExitStatus::Fail(reason) => {
                write!(f, "{}: {}", self.as_str(), reason)
            }
        }
    }
}

/// Result of one plan execution.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Plan name.
    pub plan_name: String,
    /// Runs the plan opened, in order.
    pub run_uids: Vec<String>,
    /// How the plan ended.
    pub status: ExitStatus,
}

/// Pause/abort flags shared by the engine and the running plan.
struct EngineControl {
    state: RwLock<EngineState>,
    pause_requested: RwLock<bool>,
    abort_requested: RwLock<Option<String>>,
    last_checkpoint: RwLock<Option<String>>,
}

/// A queued plan waiting to be executed
struct QueuedPlan {
    plan: Box<dyn Plan>,
    metadata: HashMap<String, String>,
    run_uid: String,
}

/// The RunEngine orchestrates plan execution
pub struct RunEngine {
    /// Device registry for hardware operations
    registry: Arc<DeviceRegistry>,

    /// State and operator requests
    control: Arc<EngineControl>,

    /// Queue of plans to execute
    plan_queue: Mutex<VecDeque<QueuedPlan>>,

    /// Document broadcast channel
    doc_sender: broadcast::Sender<Document>,
}

impl RunEngine {
    /// Create a new RunEngine
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (doc_sender, _) = broadcast::channel(1024);

        Self {
            registry,
            control: Arc::new(EngineControl {
                state: RwLock::new(EngineState::Idle),
                pause_requested: RwLock::new(false),
                abort_requested: RwLock::new(None),
                last_checkpoint: RwLock::new(None),
            }),
            plan_queue: Mutex::new(VecDeque::new()),
            doc_sender,
        }
    }

    /// Device registry plans run against.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.control.state.read().await
    }

    /// Label of the last checkpoint the running plan passed.
    pub async fn last_checkpoint(&self) -> Option<String> {
        self.control.last_checkpoint.read().await.clone()
    }

    /// Queue a plan for execution
    pub async fn queue(&self, plan: Box<dyn Plan>) -> String {
        self.queue_with_metadata(plan, HashMap::new()).await
    }

    /// Queue a plan with user-provided metadata
    pub async fn queue_with_metadata(
        &self,
        plan: Box<dyn Plan>,
        metadata: HashMap<String, String>,
    ) -> String {
        let run_uid = new_uid();
        info!(run_uid = %run_uid, plan_type = %plan.plan_type(), "Queueing plan");

        self.plan_queue.lock().await.push_back(QueuedPlan {
            plan,
            metadata,
            run_uid: run_uid.clone(),
        });

        run_uid
    }

    /// Get the number of queued plans
    pub async fn queue_len(&self) -> usize {
        self.plan_queue.lock().await.len()
    }

    /// Clear all queued plans
    pub async fn clear_queue(&self) {
        self.plan_queue.lock().await.clear();
    }

    /// Execute the next queued plan.
    ///
    /// Plan failures are reported through the outcome and the stop
    /// document; `Err` means the engine could not start at all.
    pub async fn start(&self) -> Result<PlanOutcome> {
        let current_state = *self.control.state.read().await;
        if current_state != EngineState::Idle {
            bail!("Cannot start: engine is {}", current_state);
        }

        let queued = self
            .plan_queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("No plans in queue"))?;

        *self.control.pause_requested.write().await = false;
        *self.control.abort_requested.write().await = None;
        *self.control.state.write().await = EngineState::Running;
        info!("Engine started");

        let outcome = self.execute_plan(queued).await;
        *self.control.state.write().await = EngineState::Idle;
        Ok(outcome)
    }

    /// Execute queued plans until the queue is empty.
    pub async fn run_queue(&self) -> Result<Vec<PlanOutcome>> {
        let mut outcomes = Vec::new();
        while self.queue_len().await > 0 {
            outcomes.push(self.start().await?);
        }
        Ok(outcomes)
    }

    /// Request pause at next checkpoint
    pub async fn pause(&self) -> Result<()> {
        let current_state = *self.control.state.read().await;
        if current_state != EngineState::Running {
            bail!("Cannot pause: engine is {}", current_state);
        }

        info!("Pause requested");
        *self.control.pause_requested.write().await = true;
        Ok(())
    }

    /// Resume from paused state
    pub async fn resume(&self) -> Result<()> {
        let current_state = *self.control.state.read().await;
        if current_state != EngineState::Paused {
            bail!("Cannot resume: engine is {}", current_state);
        }

        info!("Resuming from pause");
        *self.control.pause_requested.write().await = false;
        *self.control.state.write().await = EngineState::Running;
        Ok(())
    }

    /// Abort the current plan at its next checkpoint or wait.
    pub async fn abort(&self, reason: &str) -> Result<()> {
        let current_state = *self.control.state.read().await;
        match current_state {
            EngineState::Running | EngineState::Paused => {
                info!(reason = %reason, "Abort requested");
                *self.control.abort_requested.write().await = Some(reason.to_string());
                *self.control.state.write().await = EngineState::Aborting;
                Ok(())
            }
            _ => bail!("Cannot abort: engine is {}", current_state),
        }
    }

    async fn execute_plan(&self, queued: QueuedPlan) -> PlanOutcome {
        let QueuedPlan {
            plan,
            metadata,
            run_uid,
        } = queued;
        let plan_name = plan.plan_name().to_string();
        info!(plan = %plan_name, "Executing plan");

        let mut ctx = RunContext {
            registry: self.registry.clone(),
            sender: self.doc_sender.clone(),
            control: self.control.clone(),
            plan_type: plan.plan_type().to_string(),
            plan_name: plan_name.clone(),
            plan_args: plan.plan_args(),
            user_metadata: metadata,
            next_run_uid: Some(run_uid),
            run: None,
            run_uids: Vec::new(),
            groups: HashMap::new(),
            staged: Vec::new(),
        };

        let status = match plan.run(&mut ctx).await {
            Ok(()) => ExitStatus::Success,
            Err(e) => {
                let abort_reason = self.control.abort_requested.read().await.clone();
                let status = match (e.downcast_ref::<EngineError>(), abort_reason) {
                    (Some(EngineError::Aborted(reason)), _) => ExitStatus::Abort(reason.clone()),
                    (_, Some(reason)) => ExitStatus::Abort(reason),
                    _ => ExitStatus::Fail(format!("{:#}", e)),
                };
                error!(plan = %plan_name, error = %format!("{:#}", e), "Plan execution failed");
                status
            }
        };

        ctx.cleanup(&status).await;
        info!(plan = %plan_name, exit_status = %status.as_str(), "Plan execution complete");

        PlanOutcome {
            plan_name,
            run_uids: ctx.run_uids,
            status,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    descriptor_uid: String,
    seq_num: u32,
}

#[derive(Debug)]
struct OpenRun {
    uid: String,
    streams: HashMap<String, StreamState>,
    resources: HashSet<(String, String)>,
    last_collected: HashMap<(String, String), u64>,
}

/// Plan-side view of the engine: the operations a plan may perform.
pub struct RunContext {
    registry: Arc<DeviceRegistry>,
    sender: broadcast::Sender<Document>,
    control: Arc<EngineControl>,
    plan_type: String,
    plan_name: String,
    plan_args: HashMap<String, String>,
    user_metadata: HashMap<String, String>,
    next_run_uid: Option<String>,
    run: Option<OpenRun>,
    run_uids: Vec<String>,
    groups: HashMap<String, StatusGroup>,
    staged: Vec<String>,
}

impl RunContext {
    /// Device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Uid of the open run.
    pub fn run_uid(&self) -> Option<&str> {
        self.run.as_ref().map(|r| r.uid.as_str())
    }

    fn emit(&self, doc: Document) {
        debug!(kind = doc.kind(), uid = %doc.uid(), "Emitting document");
        // No subscribers is fine.
        let _ = self.sender.send(doc);
    }

    fn open(&mut self) -> Result<&mut OpenRun> {
        self.run.as_mut().ok_or_else(|| EngineError::NoOpenRun.into())
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Open a run. `metadata` must be a JSON object; its entries go into
    /// the start document next to the plan arguments and path metadata.
    pub fn open_run(&mut self, metadata: serde_json::Value) -> Result<String> {
        if let Some(run) = &self.run {
            return Err(EngineError::RunAlreadyOpen(run.uid.clone()).into());
        }
        let serde_json::Value::Object(entries) = metadata else {
            bail!("Run metadata must be a JSON object");
        };

        let mut start = StartDoc::new(&self.plan_type, &self.plan_name);
        if let Some(uid) = self.next_run_uid.take() {
            start.uid = uid;
        }
        start.plan_args = self.plan_args.clone();

        let provider = self.registry.path_provider();
        let paths = provider.metadata();
        start = start
            .with_metadata("proposal_id", paths.proposal_id.as_str())
            .with_metadata("cycle", paths.cycle.as_str())
            .with_metadata("data_session", paths.data_session.as_str())
            .with_metadata("beamline_id", paths.beamline_id.as_str());
        for (key, value) in &self.user_metadata {
            start = start.with_metadata(key, value.as_str());
        }
        start.metadata.extend(entries);

        let uid = start.uid.clone();
        info!(run_uid = %uid, plan = %self.plan_name, "Opening run");
        self.emit(Document::Start(start));
        self.run = Some(OpenRun {
            uid: uid.clone(),
            streams: HashMap::new(),
            resources: HashSet::new(),
            last_collected: HashMap::new(),
        });
        self.run_uids.push(uid.clone());
        Ok(uid)
    }

    /// Close the open run with `status`.
    pub fn close_run(&mut self, status: ExitStatus) -> Result<()> {
        let run = self.run.take().ok_or(EngineError::NoOpenRun)?;
        let num_events: HashMap<String, u32> = run
            .streams
            .iter()
            .map(|(name, s)| (name.clone(), s.seq_num))
            .collect();
        let stop = match &status {
            ExitStatus::Success => StopDoc::success(&run.uid, num_events),
            ExitStatus::Abort(reason) => StopDoc::abort(&run.uid, reason, num_events),
            ExitStatus::Fail(reason) => StopDoc::fail(&run.uid, reason, num_events),
        };
        info!(run_uid = %run.uid, exit_status = status.as_str(), "Closing run");
        self.emit(Document::Stop(stop));
        Ok(())
    }

    async fn cleanup(&mut self, status: &ExitStatus) {
        for group in self.groups.values_mut() {
            if !group.is_empty() {
                group.abort();
            }
        }
        self.groups.clear();

        if !self.staged.is_empty() {
            let leftover: Vec<String> = self.staged.iter().rev().cloned().collect();
            warn!(devices = ?leftover, "Unstaging devices the plan left staged");
            for device in leftover {
                if let Err(e) = self.unstage(&device).await {
                    warn!(device = %device, error = %e, "Unstage during cleanup failed");
                }
            }
        }

        if self.run.is_some() {
            if status.is_success() {
                warn!("Plan returned with its run still open");
            }
            // Only fails when no run is open.
            let _ = self.close_run(status.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Operator control
    // ---------------------------------------------------------------------

    async fn check_abort(&self) -> Result<()> {
        if let Some(reason) = self.control.abort_requested.read().await.clone() {
            return Err(EngineError::Aborted(reason).into());
        }
        Ok(())
    }

    /// Honour pause and abort requests.
    pub async fn checkpoint(&mut self, label: &str) -> Result<()> {
        debug!(label = %label, "Checkpoint");
        *self.control.last_checkpoint.write().await = Some(label.to_string());
        self.check_abort().await?;

        if *self.control.pause_requested.read().await {
            info!(label = %label, "Pausing at checkpoint");
            *self.control.state.write().await = EngineState::Paused;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                self.check_abort().await?;
                if *self.control.state.read().await == EngineState::Running {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Sleep inside a plan.
    pub async fn sleep(&self, seconds: f64) -> Result<()> {
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        self.check_abort().await
    }

    // ---------------------------------------------------------------------
    // Staging
    // ---------------------------------------------------------------------

    async fn stage(&mut self, device: &str) -> Result<()> {
        let stageable = self.registry.get_stageable(device);
        let Some(stageable) = stageable else {
            debug!(device = %device, "Device not stageable, skipping");
            return Ok(());
        };
        stageable
            .stage()
            .await
            .with_context(|| format!("stage {}", device))?;
        self.staged.push(device.to_string());
        Ok(())
    }

    async fn unstage(&mut self, device: &str) -> Result<()> {
        self.staged.retain(|d| d != device);
        if let Some(stageable) = self.registry.get_stageable(device) {
            stageable
                .unstage()
                .await
                .with_context(|| format!("unstage {}", device))?;
        }
        Ok(())
    }

    /// Stage devices in order. Devices without staging are skipped.
    pub async fn stage_all(&mut self, devices: &[&str]) -> Result<()> {
        for device in devices {
            self.stage(device).await?;
        }
        Ok(())
    }

    /// Unstage devices in reverse order.
    pub async fn unstage_all(&mut self, devices: &[&str]) -> Result<()> {
        for device in devices.iter().rev() {
            self.unstage(device).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Signals and motion
    // ---------------------------------------------------------------------

    /// Write one signal.
    pub async fn set_signal(
        &self,
        device: &str,
        path: &str,
        value: impl Into<SignalValue>,
    ) -> Result<()> {
        let value = value.into();
        debug!(device = %device, path = %path, value = %value, "Setting signal");
        let signal = self
            .registry
            .get_signals(device)
            .ok_or_else(|| EngineError::Capability {
                device: device.to_string(),
                capability: "SignalTree",
            })?
            .signal(path)
            .ok_or_else(|| EngineError::UnknownSignal {
                device: device.to_string(),
                path: path.to_string(),
            })?;
        signal
            .set_value(value)
            .await
            .with_context(|| format!("set {}.{}", device, path))
    }

    /// Read one signal.
    pub async fn read_signal(&self, device: &str, path: &str) -> Result<SignalValue> {
        let signal = self
            .registry
            .get_signals(device)
            .ok_or_else(|| EngineError::Capability {
                device: device.to_string(),
                capability: "SignalTree",
            })?
            .signal(path)
            .ok_or_else(|| EngineError::UnknownSignal {
                device: device.to_string(),
                path: path.to_string(),
            })?;
        signal
            .get_value()
            .await
            .with_context(|| format!("read {}.{}", device, path))
    }

    fn movable(&self, device: &str) -> Result<Arc<dyn tst_core::capabilities::Movable>> {
        self.registry.get_movable(device).ok_or_else(|| {
            EngineError::Capability {
                device: device.to_string(),
                capability: "Movable",
            }
            .into()
        })
    }

    /// Move and wait for the move to finish.
    pub async fn move_to(&self, device: &str, position: f64) -> Result<()> {
        debug!(device = %device, position, "Moving");
        self.movable(device)?
            .move_abs(position)
            .await
            .with_context(|| format!("move {} to {}", device, position))
    }

    /// Current position.
    pub async fn position(&self, device: &str) -> Result<f64> {
        self.movable(device)?.position().await
    }

    /// Set move velocity.
    pub async fn set_velocity(&self, device: &str, velocity: f64) -> Result<()> {
        debug!(device = %device, velocity, "Setting velocity");
        self.movable(device)?
            .set_velocity(velocity)
            .await
            .with_context(|| format!("set {} velocity to {}", device, velocity))
    }

    // ---------------------------------------------------------------------
    // Fly protocol
    // ---------------------------------------------------------------------

    fn group(&mut self, group: &str) -> &mut StatusGroup {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| StatusGroup::new(group))
    }

    /// Start `prepare(info)` on a device inside `group`.
    pub fn prepare(&mut self, device: &str, info: PrepareInfo, group: &str) -> Result<()> {
        let preparable = self
            .registry
            .get_preparable(device)
            .ok_or_else(|| EngineError::Capability {
                device: device.to_string(),
                capability: "Preparable",
            })?;
        self.group(group)
            .spawn(device, async move { preparable.prepare(info).await });
        Ok(())
    }

    /// Start `kickoff` on a device inside `group`.
    pub fn kickoff(&mut self, device: &str, group: &str) -> Result<()> {
        let flyable = self.flyable(device)?;
        self.group(group)
            .spawn(device, async move { flyable.kickoff().await });
        Ok(())
    }

    /// Start `complete` on a device inside `group`.
    pub fn complete(&mut self, device: &str, group: &str) -> Result<()> {
        let flyable = self.flyable(device)?;
        self.group(group)
            .spawn(device, async move { flyable.complete().await });
        Ok(())
    }

    fn flyable(&self, device: &str) -> Result<Arc<dyn tst_core::capabilities::Flyable>> {
        self.registry.get_flyable(device).ok_or_else(|| {
            EngineError::Capability {
                device: device.to_string(),
                capability: "Flyable",
            }
            .into()
        })
    }

    /// Poll `group` for up to `timeout`.
    ///
    /// `Pending` leaves the group in place to be polled again; `Done` and
    /// `Failed` retire it. An unknown group is `Done`.
    pub async fn wait(&mut self, group: &str, timeout: Duration) -> PollOutcome {
        let Some(status) = self.groups.get_mut(group) else {
            return PollOutcome::Done;
        };
        let outcome = status.poll(timeout).await;
        if outcome != PollOutcome::Pending {
            self.groups.remove(group);
        }
        outcome
    }

    /// Wait until `group` is done, honouring abort requests.
    pub async fn wait_for(&mut self, group: &str) -> Result<()> {
        loop {
            self.check_abort().await?;
            match self.wait(group, POLL_INTERVAL).await {
                PollOutcome::Done => return Ok(()),
                PollOutcome::Pending => {}
                PollOutcome::Failed(message) => bail!("Group '{}' failed: {}", group, message),
            }
        }
    }

    /// Kick off every device and wait for all of them.
    pub async fn kickoff_all(&mut self, devices: &[&str]) -> Result<()> {
        for device in devices {
            self.kickoff(device, "kickoff_all")?;
        }
        self.wait_for("kickoff_all").await
    }

    // ---------------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------------

    /// Emit the descriptor of `stream` from the collect schema of `devices`.
    ///
    /// Declaring a stream twice is a no-op.
    pub async fn declare_stream(&mut self, stream: &str, devices: &[&str]) -> Result<()> {
        let run_uid = self.open()?.uid.clone();
        if self.open()?.streams.contains_key(stream) {
            debug!(stream = %stream, "Stream already declared");
            return Ok(());
        }

        let mut descriptor = DescriptorDoc::new(&run_uid, stream);
        for device in devices {
            let keys = if let Some(collectable) = self.registry.get_collectable(device) {
                collectable.describe_collect().await?
            } else if let Some(readable) = self.registry.get_readable(device) {
                readable.describe().await?
            } else {
                return Err(EngineError::Capability {
                    device: device.to_string(),
                    capability: "Collectable",
                }
                .into());
            };
            for (name, key) in keys {
                descriptor = descriptor.with_data_key(&name, key);
            }
        }

        let uid = descriptor.uid.clone();
        self.emit(Document::Descriptor(descriptor));
        self.open()?.streams.insert(
            stream.to_string(),
            StreamState {
                descriptor_uid: uid,
                seq_num: 0,
            },
        );
        Ok(())
    }

    fn next_event(&mut self, stream: &str) -> Result<EventDoc> {
        let run = self.open()?;
        let run_uid = run.uid.clone();
        let state = run
            .streams
            .get_mut(stream)
            .ok_or_else(|| anyhow!("Stream '{}' has not been declared", stream))?;
        state.seq_num += 1;
        Ok(EventDoc::new(&run_uid, &state.descriptor_uid, state.seq_num))
    }

    /// Report what `devices` have written into `stream`.
    ///
    /// Emits a stream resource the first time a device reports its file and
    /// an event whenever a captured count has changed. Returns the total
    /// captured count.
    pub async fn collect(&mut self, stream: &str, devices: &[&str]) -> Result<u64> {
        let run_uid = self.open()?.uid.clone();
        let mut changed = Vec::new();
        let mut total = 0;

        for device in devices {
            let collectable =
                self.registry
                    .get_collectable(device)
                    .ok_or_else(|| EngineError::Capability {
                        device: device.to_string(),
                        capability: "Collectable",
                    })?;
            let assets = collectable
                .collect()
                .await
                .with_context(|| format!("collect {}", device))?;
            total += assets.num_captured;

            let key = (stream.to_string(), device.to_string());
            if let Some(resource) = assets.resource {
                if self.open()?.resources.insert(key.clone()) {
                    self.emit(Document::StreamResource(StreamResourceDoc::new(
                        &run_uid,
                        &resource.data_key,
                        resource.uri,
                        &resource.mimetype,
                    )));
                }
            }
            let previous = self.open()?.last_collected.insert(key, assets.num_captured);
            if previous != Some(assets.num_captured) {
                changed.push((device.to_string(), assets.num_captured));
            }
        }

        if !changed.is_empty() {
            let mut event = self.next_event(stream)?;
            for (device, count) in changed {
                event = event.with_datum(&device, count);
            }
            self.emit(Document::Event(event));
        }
        Ok(total)
    }

    /// Complete `complete` devices while collecting `collect` devices into
    /// `stream` every `flush_period`.
    pub async fn collect_while_completing(
        &mut self,
        complete: &[&str],
        collect: &[&str],
        stream: &str,
        flush_period: Duration,
    ) -> Result<()> {
        const GROUP: &str = "collect_while_completing";
        for device in complete {
            self.complete(device, GROUP)?;
        }
        loop {
            self.check_abort().await?;
            let outcome = self.wait(GROUP, flush_period).await;
            self.collect(stream, collect).await?;
            match outcome {
                PollOutcome::Done => return Ok(()),
                PollOutcome::Pending => {}
                PollOutcome::Failed(message) => bail!("Completion failed: {}", message),
            }
        }
    }

    /// Trigger `devices` together, read them and emit one event into `stream`.
    pub async fn trigger_and_read(&mut self, stream: &str, devices: &[&str]) -> Result<()> {
        let triggers = devices
            .iter()
            .filter_map(|d| self.registry.get_triggerable(d).map(|t| (d.to_string(), t)));
        let results = join_all(triggers.map(|(device, t)| async move {
            t.trigger()
                .await
                .with_context(|| format!("trigger {}", device))
        }))
        .await;
        for result in results {
            result?;
        }

        let run_uid = self.open()?.uid.clone();
        let mut descriptor =
            (!self.open()?.streams.contains_key(stream)).then(|| DescriptorDoc::new(&run_uid, stream));
        let mut readings = serde_json::Map::new();
        for device in devices {
            let readable =
                self.registry
                    .get_readable(device)
                    .ok_or_else(|| EngineError::Capability {
                        device: device.to_string(),
                        capability: "Readable",
                    })?;
            readings.extend(readable.read().await.with_context(|| format!("read {}", device))?);
            if let Some(desc) = descriptor.as_mut() {
                for (name, key) in readable.describe().await? {
                    desc.data_keys.insert(name, key);
                }
            }
        }

        if let Some(desc) = descriptor {
            self.open()?.streams.insert(
                stream.to_string(),
                StreamState {
                    descriptor_uid: desc.uid.clone(),
                    seq_num: 0,
                },
            );
            self.emit(Document::Descriptor(desc));
        }

        let mut event = self.next_event(stream)?;
        for (field, value) in readings {
            event = event.with_datum(&field, value);
        }
        self.emit(Document::Event(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tst_hardware::{create_mock_registry, ProposalPathProvider};

    async fn engine() -> RunEngine {
        let registry = create_mock_registry(Arc::new(ProposalPathProvider::mock("tst")))
            .await
            .unwrap();
        RunEngine::new(Arc::new(registry))
    }

    struct Scripted {
        fail: bool,
        close: bool,
    }

    #[async_trait]
    impl Plan for Scripted {
        fn plan_type(&self) -> &str {
            "scripted"
        }

        fn plan_name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, ctx: &mut RunContext) -> Result<()> {
            ctx.open_run(serde_json::json!({"scan_type": "test"}))?;
            ctx.stage_all(&["manta1"]).await?;
            ctx.trigger_and_read("primary", &["sim_det", "sim_motor"]).await?;
            if self.fail {
                bail!("detector on fire");
            }
            ctx.unstage_all(&["manta1"]).await?;
            if self.close {
                ctx.close_run(ExitStatus::Success)?;
            }
            Ok(())
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
        let mut docs = Vec::new();
        while let Ok(doc) = rx.try_recv() {
            docs.push(doc);
        }
        docs
    }

    #[tokio::test]
    async fn test_engine_state_transitions() {
        let engine = engine().await;
        assert_eq!(engine.state().await, EngineState::Idle);
        assert!(engine.pause().await.is_err());
        assert!(engine.resume().await.is_err());
        assert!(engine.abort("nothing running").await.is_err());
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn test_document_sequence() {
        let engine = engine().await;
        let mut rx = engine.subscribe();
        let run_uid = engine
            .queue(Box::new(Scripted {
                fail: false,
                close: true,
            }))
            .await;

        let outcome = engine.start().await.unwrap();
        assert!(outcome.status.is_success());
        assert_eq!(outcome.run_uids, vec![run_uid.clone()]);

        let docs = drain(&mut rx);
        let kinds: Vec<&str> = docs.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec!["start", "descriptor", "event", "stop"]);
        assert!(docs.iter().all(|d| d.run_uid() == run_uid));

        let Document::Start(start) = &docs[0] else {
            panic!("expected start");
        };
        assert_eq!(start.metadata["scan_type"], serde_json::json!("test"));
        assert_eq!(start.metadata["proposal_id"], serde_json::json!("999999"));

        let Document::Event(event) = &docs[2] else {
            panic!("expected event");
        };
        assert_eq!(event.seq_num, 1);
        assert!(event.data.contains_key("sim_det"));
        assert!(event.data.contains_key("sim_motor"));
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test]
    async fn test_failed_plan_closes_run_and_unstages() {
        let engine = engine().await;
        let mut rx = engine.subscribe();
        engine
            .queue(Box::new(Scripted {
                fail: true,
                close: true,
            }))
            .await;

        let outcome = engine.start().await.unwrap();
        assert!(matches!(&outcome.status, ExitStatus::Fail(msg) if msg.contains("detector on fire")));

        let docs = drain(&mut rx);
        let Some(Document::Stop(stop)) = docs.last() else {
            panic!("expected stop document last");
        };
        assert_eq!(stop.exit_status, "fail");
        assert_eq!(stop.num_events.get("primary"), Some(&1));

        let staged = engine
            .registry()
            .get_stageable("manta1")
            .unwrap()
            .is_staged()
            .await
            .unwrap();
        assert!(!staged);
    }

    #[tokio::test]
    async fn test_unclosed_run_is_closed_by_engine() {
        let engine = engine().await;
        let mut rx = engine.subscribe();
        engine
            .queue(Box::new(Scripted {
                fail: false,
                close: false,
            }))
            .await;
        engine.start().await.unwrap();
        let docs = drain(&mut rx);
        assert!(matches!(docs.last(), Some(Document::Stop(s)) if s.exit_status == "success"));
    }

    struct Waits;

    #[async_trait]
    impl Plan for Waits {
        fn plan_type(&self) -> &str {
            "waits"
        }

        fn plan_name(&self) -> &str {
            "waits"
        }

        async fn run(&self, ctx: &mut RunContext) -> Result<()> {
            loop {
                ctx.checkpoint("loop").await?;
                ctx.sleep(0.01).await?;
            }
        }
    }

    #[tokio::test]
    async fn test_abort_stops_plan() {
        let engine = Arc::new(engine().await);
        engine.queue(Box::new(Waits)).await;

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.state().await, EngineState::Paused);
        assert_eq!(engine.last_checkpoint().await.as_deref(), Some("loop"));

        engine.abort("operator").await.unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExitStatus::Abort("operator".to_string()));
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    struct Fly;

    #[async_trait]
    impl Plan for Fly {
        fn plan_type(&self) -> &str {
            "fly"
        }

        fn plan_name(&self) -> &str {
            "fly"
        }

        async fn run(&self, ctx: &mut RunContext) -> Result<()> {
            use tst_core::trigger::{DetectorTrigger, TriggerInfo};
            ctx.open_run(serde_json::json!({}))?;
            ctx.stage_all(&["panda1"]).await?;
            let info = TriggerInfo::new(7, DetectorTrigger::ConstantGate, 0.001, 0.0009);
            ctx.prepare("panda1", info.into(), "prepare")?;
            ctx.wait_for("prepare").await?;
            ctx.kickoff_all(&["panda1"]).await?;
            ctx.declare_stream("panda1_stream", &["panda1"]).await?;
            ctx.collect_while_completing(
                &["panda1"],
                &["panda1"],
                "panda1_stream",
                Duration::from_millis(10),
            )
            .await?;
            ctx.unstage_all(&["panda1"]).await?;
            ctx.close_run(ExitStatus::Success)
        }
    }

    #[tokio::test]
    async fn test_fly_protocol_emits_resource() {
        let engine = engine().await;
        let mut rx = engine.subscribe();
        engine.queue(Box::new(Fly)).await;
        let outcome = engine.start().await.unwrap();
        assert!(outcome.status.is_success(), "{:?}", outcome.status);

        let docs = drain(&mut rx);
        assert!(docs.iter().any(|d| d.kind() == "stream_resource"));
        let events: Vec<&EventDoc> = docs
            .iter()
            .filter_map(|d| match d {
                Document::Event(e) => Some(e),
                _ => None,
            })
            .collect();
        let last = events.last().unwrap();
        assert_eq!(last.data["panda1"], serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_wait_unknown_group_is_done() {
        let engine = engine().await;
        let mut ctx = RunContext {
            registry: engine.registry.clone(),
            sender: engine.doc_sender.clone(),
            control: engine.control.clone(),
            plan_type: "t".into(),
            plan_name: "t".into(),
            plan_args: HashMap::new(),
            user_metadata: HashMap::new(),
            next_run_uid: None,
            run: None,
            run_uids: Vec::new(),
            groups: HashMap::new(),
            staged: Vec::new(),
        };
        assert_eq!(ctx.wait("nope", Duration::from_millis(1)).await, PollOutcome::Done);
        assert!(ctx.close_run(ExitStatus::Success).is_err());
        assert!(ctx.open_run(serde_json::json!([1, 2])).is_err());
    }
}
