//! Multi-flyer coordination.
//!
//! [`FlyerCoordinator`] drives N flyers through one synchronized lifecycle.
//! `prepare_all`, `kickoff_all` and `complete_all` issue the operation to
//! every member before awaiting any of them, so device latencies overlap
//! instead of adding up as skew. `abort_all` is sequential and never fails.
//!
//! ```text
//! Null ──prepare_all──▶ Preparing ──kickoff_all──▶ Starting
//!                           │                         │
//!                           ▼                   complete_all
//!                         Error ◀──────────── Stopping ──▶ Complete
//! ```

use super::flyer::Flyer;
use super::timing::{TimingValidator, ValidationReport};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use tst_core::error::{FlyError, FlyResult};
use tst_core::policy::TimingPolicy;
use tst_core::trigger::{TimingParams, TriggerInfo, TriggerState};
use tst_hardware::config::CoordinationConfig;

/// Per-flyer outcome of [`FlyerCoordinator::abort_all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AbortReport {
    /// Flyers that completed.
    pub stopped: Vec<String>,
    /// Flyers whose `complete` failed, with the error text.
    pub failed: Vec<(String, String)>,
}

impl AbortReport {
    /// Every flyer stopped.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregates flyers into one coordinated acquisition.
pub struct FlyerCoordinator {
    name: String,
    flyers: BTreeMap<String, Box<dyn Flyer>>,
    state: TriggerState,
    prepared: bool,
    validator: TimingValidator,
    timing_policy: TimingPolicy,
}

impl Default for FlyerCoordinator {
    fn default() -> Self {
        Self::new("tst_flyer_coordinator")
    }
}

impl FlyerCoordinator {
    /// Empty coordinator with the default validator and `Warn` policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flyers: BTreeMap::new(),
            state: TriggerState::Null,
            prepared: false,
            validator: TimingValidator::default(),
            timing_policy: TimingPolicy::Warn,
        }
    }

    /// Empty coordinator configured from `config`.
    pub fn from_config(name: impl Into<String>, config: &CoordinationConfig) -> Self {
        Self::new(name)
            .with_validator(TimingValidator::new(config.timing_ratio_threshold))
            .with_timing_policy(config.timing_policy)
    }

    /// Replace the timing validator.
    pub fn with_validator(mut self, validator: TimingValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Set the reaction to an invalid timing report.
    pub fn with_timing_policy(mut self, policy: TimingPolicy) -> Self {
        self.timing_policy = policy;
        self
    }

    /// Coordinator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate state.
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Set by a successful `prepare_all`, cleared by `complete_all` and
    /// `abort_all`.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Member names, sorted.
    pub fn flyer_names(&self) -> Vec<String> {
        self.flyers.keys().cloned().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.flyers.len()
    }

    /// No members.
    pub fn is_empty(&self) -> bool {
        self.flyers.is_empty()
    }

    /// Member by name.
    pub fn flyer(&self, name: &str) -> Option<&dyn Flyer> {
        self.flyers.get(name).map(|f| &**f)
    }

    /// Last prepared timing of every member that exposes it.
    pub fn trigger_infos(&self) -> BTreeMap<String, TriggerInfo> {
        self.flyers
            .iter()
            .filter_map(|(name, f)| f.trigger_info().map(|info| (name.clone(), info)))
            .collect()
    }

    /// Add (or replace) a member.
    pub fn add_flyer(&mut self, name: impl Into<String>, flyer: Box<dyn Flyer>) {
        let name = name.into();
        if self.flyers.insert(name.clone(), flyer).is_some() {
            warn!(coordinator = %self.name, flyer = %name, "Replaced existing flyer");
        }
        info!(coordinator = %self.name, flyer = %name, "Added flyer to coordinator");
    }

    /// Remove a member. Unknown names only log a warning.
    pub fn remove_flyer(&mut self, name: &str) -> Option<Box<dyn Flyer>> {
        let removed = self.flyers.remove(name);
        if removed.is_some() {
            info!(coordinator = %self.name, flyer = %name, "Removed flyer from coordinator");
        } else {
            warn!(coordinator = %self.name, flyer = %name, "Flyer not found in coordinator");
        }
        removed
    }

    /// Prepare every member concurrently, then validate their timing.
    ///
    /// A failing member puts the coordinator in `Error` and its error is
    /// returned; the other members were still prepared and may need an
    /// `abort_all`.
    pub async fn prepare_all(&mut self, point_count: i64) -> FlyResult<ValidationReport> {
        info!(
            coordinator = %self.name,
            flyers = self.flyers.len(),
            points = point_count,
            "Preparing flyers for coordinated acquisition"
        );
        self.state = TriggerState::Preparing;
        self.prepared = false;

        let results = join_all(
            self.flyers
                .iter_mut()
                .map(|(name, flyer)| async move { (name.clone(), flyer.prepare(point_count).await) }),
        )
        .await;
        if let Err(e) = self.collect_failures("prepare", results) {
            self.state = TriggerState::Error;
            return Err(e);
        }
        info!(coordinator = %self.name, "All flyers prepared successfully");

        let params: BTreeMap<String, TimingParams> = self
            .flyers
            .iter()
            .filter_map(|(name, f)| f.timing_params().map(|p| (name.clone(), p)))
            .collect();
        let report = self.validator.validate_coordination(&params);
        for warning in &report.warnings {
            warn!(coordinator = %self.name, "Timing validation: {}", warning);
        }

        if !report.valid && self.timing_policy == TimingPolicy::Reject {
            self.state = TriggerState::Error;
            error!(coordinator = %self.name, "Flyer timing rejected");
            return Err(FlyError::CoordinationInconsistency(report.warnings));
        }

        self.prepared = true;
        Ok(report)
    }

    /// Kick off every member concurrently.
    ///
    /// On failure the state stays `Starting`; callers should `abort_all`.
    pub async fn kickoff_all(&mut self) -> FlyResult<()> {
        if self.state != TriggerState::Preparing {
            return Err(FlyError::InvalidState {
                operation: "kickoff_all",
                state: self.state,
            });
        }
        info!(coordinator = %self.name, "Starting coordinated flyer sequence");
        self.state = TriggerState::Starting;

        let results = join_all(
            self.flyers
                .iter_mut()
                .map(|(name, flyer)| async move { (name.clone(), flyer.kickoff().await) }),
        )
        .await;
        self.collect_failures("kickoff", results)?;
        info!(coordinator = %self.name, "All flyers started successfully");
        Ok(())
    }

    /// Complete every member concurrently.
    pub async fn complete_all(&mut self) -> FlyResult<()> {
        info!(coordinator = %self.name, "Completing coordinated flyer sequence");
        self.state = TriggerState::Stopping;

        let results = join_all(
            self.flyers
                .iter_mut()
                .map(|(name, flyer)| async move { (name.clone(), flyer.complete().await) }),
        )
        .await;
        if let Err(e) = self.collect_failures("complete", results) {
            self.state = TriggerState::Error;
            return Err(e);
        }

        self.state = TriggerState::Complete;
        self.prepared = false;
        info!(coordinator = %self.name, "Coordinated acquisition complete");
        Ok(())
    }

    /// Stop every member one after another, whatever happens.
    ///
    /// Per-flyer failures are logged and reported, never returned. The
    /// coordinator always ends in `Error`.
    pub async fn abort_all(&mut self) -> AbortReport {
        warn!(coordinator = %self.name, "Aborting all flyers");
        let mut report = AbortReport::default();

        for (name, flyer) in self.flyers.iter_mut() {
            match flyer.complete().await {
                Ok(()) => report.stopped.push(name.clone()),
                Err(e) => {
                    error!(coordinator = %self.name, flyer = %name, error = %e, "Error aborting flyer");
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        self.state = TriggerState::Error;
        self.prepared = false;
        report
    }

    /// Log every failure and return the first one (in name order).
    fn collect_failures(
        &self,
        phase: &'static str,
        results: Vec<(String, FlyResult<()>)>,
    ) -> FlyResult<()> {
        let mut first: Option<FlyError> = None;
        for (name, result) in results {
            let Err(e) = result else { continue };
            error!(coordinator = %self.name, flyer = %name, phase, error = %e, "Flyer failed");
            if first.is_none() {
                first = Some(FlyError::Flyer {
                    name,
                    source: Box::new(e),
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for FlyerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyerCoordinator")
            .field("name", &self.name)
            .field("flyers", &self.flyer_names())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flyers::flyer::DeviceFlyer;
    use crate::flyers::trigger_logic::TriggerSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Calls {
        prepare: Vec<(String, Instant)>,
        kickoff: Vec<String>,
        complete: Vec<String>,
    }

    struct FakeFlyer {
        name: String,
        state: TriggerState,
        fail_prepare: bool,
        fail_kickoff: bool,
        fail_complete: bool,
        calls: Arc<Mutex<Calls>>,
        timing: Option<TimingParams>,
    }

    impl FakeFlyer {
        fn fake(name: &str, calls: &Arc<Mutex<Calls>>) -> Self {
            Self {
                name: name.to_string(),
                state: TriggerState::Null,
                fail_prepare: false,
                fail_kickoff: false,
                fail_complete: false,
                calls: calls.clone(),
                timing: None,
            }
        }
    }

    #[async_trait]
    impl Flyer for FakeFlyer {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> TriggerState {
            self.state
        }

        async fn prepare(&mut self, _point_count: i64) -> FlyResult<()> {
            self.calls.lock().prepare.push((self.name.clone(), Instant::now()));
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_prepare {
                self.state = TriggerState::Error;
                return Err(FlyError::device(&self.name, "prepare", anyhow::anyhow!("offline")));
            }
            self.state = TriggerState::Preparing;
            Ok(())
        }

        async fn kickoff(&mut self) -> FlyResult<()> {
            self.calls.lock().kickoff.push(self.name.clone());
            if self.fail_kickoff {
                self.state = TriggerState::Error;
                return Err(FlyError::device(&self.name, "kickoff", anyhow::anyhow!("no trigger")));
            }
            self.state = TriggerState::Starting;
            Ok(())
        }

        async fn complete(&mut self) -> FlyResult<()> {
            self.calls.lock().complete.push(self.name.clone());
            if self.fail_complete {
                return Err(FlyError::device(&self.name, "complete", anyhow::anyhow!("stuck")));
            }
            self.state = TriggerState::Complete;
            Ok(())
        }

        fn timing_params(&self) -> Option<TimingParams> {
            self.timing
        }
    }

    fn quick() -> TriggerSettings {
        TriggerSettings {
            prepare_settle: Duration::ZERO,
            stop_settle: Duration::ZERO,
            ..TriggerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_attempts_every_flyer() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        coordinator.add_flyer("a", Box::new(FakeFlyer::fake("a", &calls)));
        let mut bad = FakeFlyer::fake("b", &calls);
        bad.fail_prepare = true;
        coordinator.add_flyer("b", Box::new(bad));
        coordinator.add_flyer("c", Box::new(FakeFlyer::fake("c", &calls)));

        let err = coordinator.prepare_all(10).await.unwrap_err();
        assert!(matches!(&err, FlyError::Flyer { name, .. } if name == "b"));
        assert!(matches!(err.root(), FlyError::DeviceCommunication { .. }));
        assert_eq!(coordinator.state(), TriggerState::Error);
        assert!(!coordinator.is_prepared());

        let mut names: Vec<String> = calls.lock().prepare.iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prepare_is_issued_concurrently() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        for name in ["a", "b", "c", "d"] {
            coordinator.add_flyer(name, Box::new(FakeFlyer::fake(name, &calls)));
        }

        coordinator.prepare_all(5).await.unwrap();

        let starts: Vec<Instant> = calls.lock().prepare.iter().map(|(_, t)| *t).collect();
        assert_eq!(starts.len(), 4);
        let first = starts.iter().min().copied().unwrap();
        let last = starts.iter().max().copied().unwrap();
        // Every prepare started before the first 20 ms sleep finished.
        assert!(last.duration_since(first) < Duration::from_millis(15));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_abort_continues_past_failures() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        let mut x = FakeFlyer::fake("x", &calls);
        x.fail_complete = true;
        coordinator.add_flyer("x", Box::new(x));
        coordinator.add_flyer("y", Box::new(FakeFlyer::fake("y", &calls)));

        let report = coordinator.abort_all().await;
        assert_eq!(report.stopped, vec!["y"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "x");
        assert!(!report.is_clean());
        assert_eq!(calls.lock().complete, vec!["x", "y"]);
        assert_eq!(coordinator.state(), TriggerState::Error);
        assert!(logs_contain("Error aborting flyer"));
    }

    #[tokio::test]
    async fn test_kickoff_failure_stays_starting() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        coordinator.add_flyer("a", Box::new(FakeFlyer::fake("a", &calls)));
        let mut bad = FakeFlyer::fake("b", &calls);
        bad.fail_kickoff = true;
        coordinator.add_flyer("b", Box::new(bad));
        coordinator.add_flyer("c", Box::new(FakeFlyer::fake("c", &calls)));

        coordinator.prepare_all(10).await.unwrap();
        let err = coordinator.kickoff_all().await.unwrap_err();
        assert!(matches!(&err, FlyError::Flyer { name, .. } if name == "b"));
        assert_eq!(coordinator.state(), TriggerState::Starting);

        let mut kicked = calls.lock().kickoff.clone();
        kicked.sort();
        assert_eq!(kicked, vec!["a", "b", "c"]);
        assert_eq!(coordinator.flyer("a").map(|f| f.state()), Some(TriggerState::Starting));
        assert_eq!(coordinator.flyer("c").map(|f| f.state()), Some(TriggerState::Starting));
    }

    #[tokio::test]
    async fn test_kickoff_requires_preparing() {
        let mut coordinator = FlyerCoordinator::default();
        assert!(matches!(
            coordinator.kickoff_all().await,
            Err(FlyError::InvalidState { operation: "kickoff_all", state: TriggerState::Null })
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_device_flyers() {
        let mut coordinator = FlyerCoordinator::default();
        coordinator.add_flyer("one", Box::new(DeviceFlyer::generic("one").with_settings(quick())));
        coordinator.add_flyer("two", Box::new(DeviceFlyer::generic("two").with_settings(quick())));

        let report = coordinator.prepare_all(20).await.unwrap();
        assert!(report.valid);
        assert!(report.warnings.is_empty());
        assert!(coordinator.is_prepared());
        assert_eq!(coordinator.trigger_infos().len(), 2);

        coordinator.kickoff_all().await.unwrap();
        assert_eq!(coordinator.state(), TriggerState::Starting);
        assert_eq!(coordinator.flyer("one").map(|f| f.state()), Some(TriggerState::Starting));

        coordinator.complete_all().await.unwrap();
        assert_eq!(coordinator.state(), TriggerState::Complete);
        assert!(!coordinator.is_prepared());

        // Reusable.
        coordinator.prepare_all(20).await.unwrap();
        assert_eq!(coordinator.state(), TriggerState::Preparing);
    }

    #[tokio::test]
    async fn test_complete_failure_sets_error() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        let mut x = FakeFlyer::fake("x", &calls);
        x.fail_complete = true;
        coordinator.add_flyer("x", Box::new(x));
        coordinator.add_flyer("y", Box::new(FakeFlyer::fake("y", &calls)));

        assert!(coordinator.complete_all().await.is_err());
        assert_eq!(coordinator.state(), TriggerState::Error);
        assert_eq!(calls.lock().complete.len(), 2);
    }

    fn timed(name: &str, total_time: f64, calls: &Arc<Mutex<Calls>>) -> FakeFlyer {
        let mut flyer = FakeFlyer::fake(name, calls);
        flyer.timing = Some(TimingParams {
            num_triggers: 10,
            deadtime: 0.01,
            livetime: 0.009,
            total_time,
        });
        flyer
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_timing_warns_by_default() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default();
        coordinator.add_flyer("a", Box::new(timed("a", 1.0, &calls)));
        coordinator.add_flyer("b", Box::new(timed("b", 1.5, &calls)));

        let report = coordinator.prepare_all(10).await.unwrap();
        assert!(!report.valid);
        assert_eq!(coordinator.state(), TriggerState::Preparing);
        assert!(logs_contain("Timing validation"));
    }

    #[tokio::test]
    async fn test_invalid_timing_rejected_by_policy() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut coordinator = FlyerCoordinator::default().with_timing_policy(TimingPolicy::Reject);
        coordinator.add_flyer("a", Box::new(timed("a", 1.0, &calls)));
        coordinator.add_flyer("b", Box::new(timed("b", 1.5, &calls)));

        assert!(matches!(
            coordinator.prepare_all(10).await,
            Err(FlyError::CoordinationInconsistency(_))
        ));
        assert_eq!(coordinator.state(), TriggerState::Error);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_remove_unknown_flyer_warns() {
        let mut coordinator = FlyerCoordinator::default();
        coordinator.add_flyer("a", Box::new(DeviceFlyer::generic("a")));
        assert!(coordinator.remove_flyer("missing").is_none());
        assert!(logs_contain("Flyer not found in coordinator"));
        assert!(coordinator.remove_flyer("a").is_some());
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = CoordinationConfig {
            timing_ratio_threshold: 1.5,
            timing_policy: TimingPolicy::Reject,
            ..CoordinationConfig::default()
        };
        let coordinator = FlyerCoordinator::from_config("c", &config);
        assert_eq!(coordinator.validator.ratio_threshold(), 1.5);
        assert_eq!(coordinator.timing_policy, TimingPolicy::Reject);
    }
}
