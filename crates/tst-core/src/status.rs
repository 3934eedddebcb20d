//! Named groups of in-flight device operations.
//!
//! Plans start device operations (`prepare`, `kickoff`, `complete`) into a
//! named group and later wait on the group. Waiting is a bounded poll with a
//! tri-state answer: a timeout is reported as [`PollOutcome::Pending`] so
//! the caller can do other work (collect partial data) and poll again.

use anyhow::Result;
use futures::future::{self, FutureExt};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Result of polling a status group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every member finished successfully.
    Done,
    /// At least one member is still running and none has failed.
    Pending,
    /// At least one member failed; the message names each failure.
    Failed(String),
}

impl PollOutcome {
    /// `true` for [`PollOutcome::Done`].
    pub fn is_done(&self) -> bool {
        matches!(self, PollOutcome::Done)
    }
}

struct Member {
    label: String,
    handle: Option<JoinHandle<Result<()>>>,
    failure: Option<String>,
}

/// A named set of spawned device operations.
pub struct StatusGroup {
    name: String,
    members: Vec<Member>,
}

impl StatusGroup {
    /// Empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of operations in the group.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no operations.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Track an already spawned task.
    pub fn add(&mut self, label: impl Into<String>, handle: JoinHandle<Result<()>>) {
        self.members.push(Member {
            label: label.into(),
            handle: Some(handle),
            failure: None,
        });
    }

    /// Spawn `fut` on the runtime and track it.
    pub fn spawn<F>(&mut self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.add(label, tokio::spawn(fut));
    }

    /// Wait up to `timeout` for every member.
    ///
    /// Members are awaited together, so a failure is reported as soon as any
    /// member fails, whatever its position in the group. Members that are
    /// still running when the timeout elapses keep running and can be polled
    /// again.
    pub async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let failures: Vec<&str> = self
                .members
                .iter()
                .filter_map(|m| m.failure.as_deref())
                .collect();
            if !failures.is_empty() {
                return PollOutcome::Failed(failures.join("; "));
            }

            let running: Vec<_> = self
                .members
                .iter_mut()
                .enumerate()
                .filter_map(|(index, m)| {
                    m.handle
                        .as_mut()
                        .map(|handle| handle.map(move |joined| (index, joined)))
                })
                .collect();
            if running.is_empty() {
                return PollOutcome::Done;
            }

            let first = tokio::time::timeout_at(deadline, future::select_all(running))
                .await
                .map(|(finished, _, _)| finished);
            let Ok((index, joined)) = first else {
                return PollOutcome::Pending;
            };

            let member = &mut self.members[index];
            member.handle = None;
            member.failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{}: {:#}", member.label, e)),
                Err(join_err) => Some(format!("{}: {}", member.label, join_err)),
            };
        }
    }

    /// Abort every member that is still running.
    pub fn abort(&mut self) {
        for member in &mut self.members {
            if let Some(handle) = member.handle.take() {
                debug!(group = %self.name, operation = %member.label, "Cancelling operation");
                handle.abort();
                member.failure = Some(format!("{}: aborted", member.label));
            }
        }
    }
}

impl std::fmt::Debug for StatusGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusGroup")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_group_is_done() {
        let mut group = StatusGroup::new("empty");
        assert_eq!(group.poll(Duration::from_millis(1)).await, PollOutcome::Done);
    }

    #[tokio::test]
    async fn test_pending_then_done() {
        let mut group = StatusGroup::new("complete");
        group.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(())
        });

        assert_eq!(group.poll(Duration::from_millis(5)).await, PollOutcome::Pending);
        assert_eq!(group.poll(Duration::from_secs(2)).await, PollOutcome::Done);
        // Polling a finished group again is stable.
        assert_eq!(group.poll(Duration::from_millis(1)).await, PollOutcome::Done);
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let mut group = StatusGroup::new("prepare");
        group.spawn("ok", async { Ok(()) });
        group.spawn("det", async { anyhow::bail!("hdf plugin not ready") });

        match group.poll(Duration::from_secs(1)).await {
            PollOutcome::Failed(msg) => assert!(msg.contains("det: hdf plugin not ready")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_marks_running_members_failed() {
        let mut group = StatusGroup::new("kickoff");
        group.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        group.abort();
        assert!(matches!(
            group.poll(Duration::from_millis(1)).await,
            PollOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_failure_behind_slow_member_is_reported() {
        let mut group = StatusGroup::new("complete");
        group.spawn("manta", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        group.spawn("panda", async { anyhow::bail!("detector offline") });
        tokio::time::sleep(Duration::from_millis(20)).await;

        match group.poll(Duration::from_millis(50)).await {
            PollOutcome::Failed(msg) => assert!(msg.contains("panda: detector offline")),
            other => panic!("expected failure, got {:?}", other),
        }
        group.abort();
    }

    #[tokio::test]
    async fn test_later_member_finishing_first_is_kept() {
        let mut group = StatusGroup::new("kickoff");
        group.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(())
        });
        group.spawn("fast", async { Ok(()) });

        assert_eq!(group.poll(Duration::from_millis(5)).await, PollOutcome::Pending);
        assert_eq!(group.poll(Duration::from_secs(2)).await, PollOutcome::Done);
    }
}
