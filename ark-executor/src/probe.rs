//! Readiness prober: poll-with-deadline in place of fixed sleeps.
//!
//! A launched subsystem is only usable by the next step once its
//! subsystem-specific readiness signal passes. The prober polls that signal
//! with exponential backoff until it passes, the process dies, or the
//! deadline elapses, whichever comes first.

use std::fmt;
use std::time::Duration;

use ark_core::SubsystemStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{ProcessSupervisor, SubsystemHandle};

/// A subsystem-specific readiness signal.
///
/// Implementations must be cheap to call repeatedly and must not block for
/// long; the prober bounds each call by the remaining deadline regardless.
#[async_trait]
pub trait ReadinessCheck: Send + Sync + fmt::Debug {
    /// Returns `true` once the subsystem is usable.
    ///
    /// `status` is the supervisor's reading taken just before the call.
    async fn is_ready(&self, handle: &SubsystemHandle, status: SubsystemStatus) -> bool;
}

/// Polling parameters for one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Delay after the first failed check.
    pub interval: Duration,
    /// Upper bound for the doubled delay.
    pub max_interval: Duration,
    /// Total time allowed before giving up.
    pub deadline: Duration,
}

impl ProbePolicy {
    /// A policy that starts at `interval` and waits at most `deadline`.
    #[must_use]
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            max_interval: Duration::from_secs(1),
            deadline,
        }
    }

    /// Override the backoff ceiling.
    #[must_use]
    pub const fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(60))
    }
}

/// Result of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The check passed.
    Ready,
    /// The deadline elapsed first.
    Timeout {
        /// How long the prober actually waited.
        waited: Duration,
    },
    /// The process exited or crashed before the check passed.
    SubsystemCrashed {
        /// The supervisor's final reading.
        status: SubsystemStatus,
    },
}

/// Wait until `check` passes for `handle`.
///
/// Each round polls the supervisor first, then evaluates the check. A check
/// is allowed to pass on an exited process; that is how one-shot subsystems
/// signal completion. On `Ready` the handle is marked
/// [`SubsystemStatus::Ready`].
///
/// # Cancel Safety
/// Cancel safe. Dropping the future stops polling; the subsystem process
/// is untouched.
pub async fn await_ready(
    supervisor: &ProcessSupervisor,
    handle: &SubsystemHandle,
    check: &dyn ReadinessCheck,
    policy: ProbePolicy,
) -> ReadinessOutcome {
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let mut interval = policy.interval;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let status = supervisor.poll(handle);

        let ready = tokio::time::timeout_at(deadline, check.is_ready(handle, status))
            .await
            .unwrap_or(false);
        if ready {
            handle.mark_ready();
            tracing::info!(
                vm = %handle.owner,
                tag = %handle.tag,
                attempts,
                elapsed_ms = started.elapsed().as_millis(),
                "subsystem ready"
            );
            return ReadinessOutcome::Ready;
        }

        if !status.is_alive() {
            tracing::warn!(vm = %handle.owner, tag = %handle.tag, %status, "subsystem died before becoming ready");
            return ReadinessOutcome::SubsystemCrashed { status };
        }

        let now = Instant::now();
        if now >= deadline {
            let waited = now.duration_since(started);
            tracing::warn!(
                vm = %handle.owner,
                tag = %handle.tag,
                attempts,
                waited_ms = waited.as_millis(),
                check = ?check,
                "subsystem readiness timed out"
            );
            return ReadinessOutcome::Timeout { waited };
        }

        tracing::trace!(vm = %handle.owner, tag = %handle.tag, attempts, "not ready yet");
        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = interval.saturating_mul(2).min(policy.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use ark_core::{SubsystemTag, VmName};

    use super::*;
    use crate::LaunchSpec;

    #[derive(Debug)]
    struct Never;

    #[async_trait]
    impl ReadinessCheck for Never {
        async fn is_ready(&self, _handle: &SubsystemHandle, _status: SubsystemStatus) -> bool {
            false
        }
    }

    #[derive(Debug, Default)]
    struct AfterAttempts {
        needed: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl ReadinessCheck for AfterAttempts {
        async fn is_ready(&self, _handle: &SubsystemHandle, _status: SubsystemStatus) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.needed
        }
    }

    #[derive(Debug)]
    struct Hangs;

    #[async_trait]
    impl ReadinessCheck for Hangs {
        async fn is_ready(&self, _handle: &SubsystemHandle, _status: SubsystemStatus) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }
    }

    fn launch(sup: &ProcessSupervisor, script: &str) -> Arc<SubsystemHandle> {
        let owner = match VmName::new("probe-test") {
            Ok(n) => n,
            Err(e) => panic!("bad name: {e}"),
        };
        let spec = LaunchSpec::new(SubsystemTag::Network, "sh").args(["-c", script]);
        match sup.launch(&owner, spec) {
            Ok(h) => h,
            Err(e) => panic!("launch failed: {e}"),
        }
    }

    #[tokio::test]
    async fn ready_check_returns_promptly_and_marks_handle() {
        let sup = ProcessSupervisor::new();
        let handle = launch(&sup, "sleep 30");
        let check = AfterAttempts { needed: 3, ..Default::default() };

        let started = std::time::Instant::now();
        let outcome = await_ready(&sup, &handle, &check, ProbePolicy::new(
            Duration::from_millis(10),
            Duration::from_secs(10),
        ))
        .await;

        assert_eq!(outcome, ReadinessOutcome::Ready);
        assert!(started.elapsed() < Duration::from_secs(1), "fast subsystems must not wait the deadline");
        assert_eq!(handle.observed(), SubsystemStatus::Ready);
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn never_ready_times_out_within_deadline() {
        let sup = ProcessSupervisor::new();
        let handle = launch(&sup, "sleep 30");
        let deadline = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let outcome = await_ready(&sup, &handle, &Never, ProbePolicy::new(Duration::from_millis(20), deadline)).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, ReadinessOutcome::Timeout { .. }), "got {outcome:?}");
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + Duration::from_millis(500), "timeout overshot: {elapsed:?}");
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn hanging_check_is_bounded_by_deadline() {
        let sup = ProcessSupervisor::new();
        let handle = launch(&sup, "sleep 30");
        let deadline = Duration::from_millis(200);

        let started = std::time::Instant::now();
        let outcome = await_ready(&sup, &handle, &Hangs, ProbePolicy::new(Duration::from_millis(20), deadline)).await;

        assert!(matches!(outcome, ReadinessOutcome::Timeout { .. }), "got {outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dead_subsystem_is_reported_before_deadline() {
        let sup = ProcessSupervisor::new();
        let handle = launch(&sup, "exit 7");

        let started = std::time::Instant::now();
        let outcome = await_ready(&sup, &handle, &Never, ProbePolicy::new(
            Duration::from_millis(10),
            Duration::from_secs(10),
        ))
        .await;

        assert_eq!(
            outcome,
            ReadinessOutcome::SubsystemCrashed { status: SubsystemStatus::Exited { code: 7 } }
        );
        assert!(started.elapsed() < Duration::from_secs(2), "crash must short-circuit the wait");
    }

    #[test]
    fn default_policy_backs_off_to_one_second() {
        let policy = ProbePolicy::default();
        assert_eq!(policy.max_interval, Duration::from_secs(1));
        assert!(policy.interval < policy.max_interval);
    }
}
