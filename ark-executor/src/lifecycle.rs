//! VM lifecycle state machine.
//!
//! Sequences the subsystems of each instance through
//! CREATING → READY → STARTING → RUNNING → STOPPING → STOPPED, with FAILED
//! reachable from every in-flight state. Each transition runs on its own
//! spawned task holding the instance's transition guard, so a caller that
//! gives up waiting never strands a record mid-transition.

use std::future::Future;
use std::sync::Arc;

use ark_core::{LifecycleState, SubsystemTag, VmName, VmSpec};
use serde::Serialize;

use crate::backend::SubsystemBackend;
use crate::probe::{await_ready, ReadinessOutcome};
use crate::registry::{InstanceEntry, InstanceRecord, InstanceRegistry, TransitionGuard};
use crate::status::{InstanceStatus, InstanceSummary};
use crate::{ExecutorError, InstanceLayout, OrchestratorConfig, ProcessSupervisor, TeardownReport};

/// Subsystems brought up by `create`, in launch order.
const CREATE_PHASE: [SubsystemTag; 2] = [SubsystemTag::Network, SubsystemTag::Snapshotter];

/// Subsystems brought up by `start`, in launch order.
const START_PHASE: [SubsystemTag; 2] = [SubsystemTag::Resume, SubsystemTag::Forwarder];

/// Result of a `stop` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub state: LifecycleState,
    pub teardown: TeardownReport,
}

/// Answer to a `migrate` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub supported: bool,
}

/// Orchestrates VM instances on top of a [`SubsystemBackend`].
///
/// Cheap to clone; clones share the registry and supervisor.
pub struct VmOrchestrator<B: SubsystemBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: SubsystemBackend> Clone for VmOrchestrator<B> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

struct Shared<B> {
    backend: B,
    supervisor: ProcessSupervisor,
    registry: InstanceRegistry,
    config: OrchestratorConfig,
}

impl<B: SubsystemBackend> VmOrchestrator<B> {
    /// Create an orchestrator with an empty registry.
    #[must_use]
    pub fn new(backend: B, config: OrchestratorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                supervisor: ProcessSupervisor::new(),
                registry: InstanceRegistry::new(config.max_instances),
                config,
            }),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.shared.supervisor
    }

    /// Register a new instance and bring it to READY.
    ///
    /// Prepares the instance layout, then launches the network and
    /// snapshot subsystems one after the other, waiting for each to become
    /// ready. Any failure tears down what was launched and leaves the
    /// instance FAILED.
    ///
    /// # Cancel Safety
    /// Dropping the future does not cancel the transition.
    ///
    /// # Errors
    /// Returns [`ExecutorError::AlreadyExists`] for a registered name,
    /// [`ExecutorError::SlotsExhausted`] when no namespace slot is free, or
    /// the error that failed the transition.
    pub async fn create(&self, spec: VmSpec) -> Result<LifecycleState, ExecutorError> {
        let guard = self.shared.registry.insert_new(spec)?;
        tracing::info!(vm = %guard.entry().name(), slot = guard.entry().slot(), "creating VM");
        let shared = Arc::clone(&self.shared);
        detached(async move { shared.run_create(guard).await }).await
    }

    /// Run `create` again on a FAILED instance, reusing its spec and slot.
    ///
    /// # Cancel Safety
    /// Dropping the future does not cancel the transition.
    ///
    /// # Errors
    /// Returns [`ExecutorError::StateConflict`] unless the instance is
    /// FAILED, otherwise as [`create`](Self::create).
    pub async fn retry(&self, name: &VmName) -> Result<LifecycleState, ExecutorError> {
        let guard = self.begin(name)?;
        let state = guard.entry().state();
        if state != LifecycleState::Failed {
            return Err(ExecutorError::StateConflict { name: name.clone(), state, operation: "retry" });
        }
        tracing::info!(vm = %name, "retrying VM creation");
        let shared = Arc::clone(&self.shared);
        detached(async move { shared.run_create(guard).await }).await
    }

    /// Bring a READY instance to RUNNING.
    ///
    /// Launches the resume process, waits for its control endpoint, then
    /// launches the port forwarder and waits for its listeners.
    ///
    /// # Cancel Safety
    /// Dropping the future does not cancel the transition.
    ///
    /// # Errors
    /// Returns [`ExecutorError::StateConflict`] unless the instance is
    /// READY (nothing is launched in that case), or the error that failed
    /// the transition.
    pub async fn start(&self, name: &VmName) -> Result<LifecycleState, ExecutorError> {
        let guard = self.begin(name)?;
        let record = guard.entry().snapshot();
        let layout = match (record.state, record.layout) {
            (LifecycleState::Ready, Some(layout)) => layout,
            (state, _) => {
                return Err(ExecutorError::StateConflict { name: name.clone(), state, operation: "start" });
            }
        };
        let shared = Arc::clone(&self.shared);
        detached(async move { shared.run_start(guard, layout).await }).await
    }

    /// Tear down every subsystem the instance owns, newest first.
    ///
    /// Always ends in STOPPED; termination failures are reported in the
    /// outcome and recorded as the instance's last error. Stopping a
    /// STOPPED instance is a no-op.
    ///
    /// # Cancel Safety
    /// Dropping the future does not cancel the teardown.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`] or
    /// [`ExecutorError::TransitionInProgress`].
    pub async fn stop(&self, name: &VmName) -> Result<StopOutcome, ExecutorError> {
        let guard = self.begin(name)?;
        if guard.entry().state() == LifecycleState::Stopped {
            tracing::debug!(vm = %name, "stop on stopped VM is a no-op");
            return Ok(StopOutcome { state: LifecycleState::Stopped, teardown: TeardownReport::default() });
        }
        let shared = Arc::clone(&self.shared);
        detached(async move { Ok(shared.run_stop(guard).await) }).await
    }

    /// Point-in-time snapshot of an instance and its subsystems.
    ///
    /// Never waits on a running transition.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`] for unknown names.
    pub fn status(&self, name: &VmName) -> Result<InstanceStatus, ExecutorError> {
        let entry = self.shared.registry.get(name)?;
        Ok(InstanceStatus::collect(&self.shared.supervisor, &entry.snapshot()))
    }

    /// Live migration is not supported. Touches nothing.
    #[must_use]
    pub fn migrate(&self, name: &str) -> MigrationStatus {
        tracing::info!(vm = name, "migration requested but not supported");
        MigrationStatus { name: name.to_owned(), supported: false }
    }

    /// Forget a STOPPED or FAILED instance and release its namespace slot.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotFound`],
    /// [`ExecutorError::TransitionInProgress`], or
    /// [`ExecutorError::StateConflict`] for instances that are not terminal.
    pub async fn purge(&self, name: &VmName) -> Result<(), ExecutorError> {
        let guard = self.begin(name)?;
        let record = guard.entry().snapshot();
        if !record.state.is_terminal() {
            return Err(ExecutorError::StateConflict { name: name.clone(), state: record.state, operation: "purge" });
        }
        // FAILED instances keep their dead handles for diagnostics.
        let leftovers: Vec<_> = record.handles.into_iter().rev().collect();
        let report = self.shared.supervisor.terminate_many(&leftovers, self.shared.config.grace_period).await;
        if !report.is_clean() {
            tracing::warn!(vm = %name, failures = report.failures.len(), "purging VM with unterminated subsystems");
        }
        self.shared.registry.remove(guard)?;
        tracing::info!(vm = %name, "VM purged");
        Ok(())
    }

    /// Name and state of every registered instance.
    #[must_use]
    pub fn list(&self) -> Vec<InstanceSummary> {
        self.shared
            .registry
            .list()
            .iter()
            .map(|entry| InstanceSummary::from(&entry.snapshot()))
            .collect()
    }

    /// Check that the backend is usable.
    ///
    /// # Errors
    /// Propagates [`SubsystemBackend::health_check`].
    pub async fn health_check(&self) -> Result<(), ExecutorError> {
        self.shared.backend.health_check().await
    }

    /// Terminate every supervised subsystem. Used on service shutdown.
    pub async fn shutdown(&self) -> TeardownReport {
        let report = self
            .shared
            .supervisor
            .terminate_all(None, self.shared.config.grace_period)
            .await;
        tracing::info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "all subsystems terminated"
        );
        report
    }

    fn begin(&self, name: &VmName) -> Result<TransitionGuard, ExecutorError> {
        self.shared.registry.get(name)?.try_begin()
    }
}

impl<B: SubsystemBackend> Shared<B> {
    async fn run_create(&self, guard: TransitionGuard) -> Result<LifecycleState, ExecutorError> {
        let entry = guard.entry();
        let stale = entry.update(|r| {
            r.last_error = None;
            std::mem::take(&mut r.handles)
        });
        // Leftovers of a failed attempt, normally dead already.
        self.supervisor.terminate_many(&stale, self.config.grace_period).await;
        let spec = transition(entry, LifecycleState::Creating).spec;

        let layout = match self.backend.prepare(&spec, entry.slot()).await {
            Ok(layout) => layout,
            Err(e) => return Err(self.fail(entry, e).await),
        };
        entry.update(|r| r.layout = Some(layout.clone()));

        if let Err(e) = self.bring_up(entry, &CREATE_PHASE, &spec, &layout).await {
            return Err(self.fail(entry, e).await);
        }
        transition(entry, LifecycleState::Ready);
        Ok(LifecycleState::Ready)
    }

    async fn run_start(&self, guard: TransitionGuard, layout: InstanceLayout) -> Result<LifecycleState, ExecutorError> {
        let entry = guard.entry();
        let spec = transition(entry, LifecycleState::Starting).spec;

        if let Err(e) = self.bring_up(entry, &START_PHASE, &spec, &layout).await {
            return Err(self.fail(entry, e).await);
        }
        transition(entry, LifecycleState::Running);
        Ok(LifecycleState::Running)
    }

    async fn run_stop(&self, guard: TransitionGuard) -> StopOutcome {
        let entry = guard.entry();
        let handles: Vec<_> = transition(entry, LifecycleState::Stopping)
            .handles
            .into_iter()
            .rev()
            .collect();

        let teardown = self.supervisor.terminate_many(&handles, self.config.grace_period).await;
        commit_stop(entry, &teardown);
        StopOutcome { state: LifecycleState::Stopped, teardown }
    }

    /// Launch `tags` strictly in order, each one ready before the next.
    async fn bring_up(
        &self,
        entry: &InstanceEntry,
        tags: &[SubsystemTag],
        spec: &VmSpec,
        layout: &InstanceLayout,
    ) -> Result<(), ExecutorError> {
        for &tag in tags {
            let plan = self.backend.plan(tag, spec, layout);
            let handle = self.supervisor.launch(entry.name(), plan.launch)?;
            entry.update(|r| r.handles.push(Arc::clone(&handle)));

            match await_ready(&self.supervisor, &handle, plan.check.as_ref(), plan.policy).await {
                ReadinessOutcome::Ready => {}
                ReadinessOutcome::Timeout { waited } => {
                    return Err(ExecutorError::ReadinessTimeout { tag, waited });
                }
                ReadinessOutcome::SubsystemCrashed { status } => {
                    return Err(ExecutorError::SubsystemCrashed { tag, status });
                }
            }
        }
        Ok(())
    }

    /// Tear down everything the instance owns and mark it FAILED.
    async fn fail(&self, entry: &InstanceEntry, error: ExecutorError) -> ExecutorError {
        let handles: Vec<_> = entry.snapshot().handles.into_iter().rev().collect();
        let teardown = self.supervisor.terminate_many(&handles, self.config.grace_period).await;
        tracing::warn!(
            vm = %entry.name(),
            error = %error,
            torn_down = teardown.stopped.len(),
            teardown_failures = teardown.failures.len(),
            "transition failed"
        );
        entry.update(|r| r.last_error = Some(error.to_string()));
        transition(entry, LifecycleState::Failed);
        error
    }
}

/// Commit a state change and return the record as it was before.
fn transition(entry: &InstanceEntry, to: LifecycleState) -> InstanceRecord {
    let before = entry.update(|r| {
        let before = r.clone();
        r.state = to;
        before
    });
    tracing::info!(vm = %entry.name(), from = %before.state, to = %to, "state transition");
    before
}

/// Record the end of a teardown. The instance is STOPPED whatever the
/// report says; subsystems that refused to die are named in `last_error`.
fn commit_stop(entry: &InstanceEntry, teardown: &TeardownReport) {
    entry.update(|r| {
        r.handles.clear();
        if !teardown.is_clean() {
            let tags: Vec<_> = teardown.failures.iter().map(|f| f.tag.as_str()).collect();
            r.last_error = Some(format!("teardown failed for: {}", tags.join(", ")));
        }
    });
    transition(entry, LifecycleState::Stopped);
}

/// Run a transition on its own task so it survives the caller.
async fn detached<T, F>(transition: F) -> Result<T, ExecutorError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ExecutorError>> + Send + 'static,
{
    tokio::spawn(transition)
        .await
        .map_err(|e| ExecutorError::TaskAborted(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LaunchSpec, TeardownFailure};

    fn spec(name: &str) -> VmSpec {
        match VmSpec::parse(name, "1G", 1, "2G", "/images/os.tar.zst") {
            Ok(s) => s,
            Err(e) => panic!("bad spec: {e}"),
        }
    }

    #[tokio::test]
    async fn failed_teardown_still_commits_stopped() {
        let registry = InstanceRegistry::new(1);
        let guard = match registry.insert_new(spec("stubborn")) {
            Ok(g) => g,
            Err(e) => panic!("insert failed: {e}"),
        };
        let entry = guard.entry();

        let supervisor = ProcessSupervisor::new();
        let launch = LaunchSpec::new(SubsystemTag::Resume, "sh").args(["-c", "exit 0"]);
        let handle = match supervisor.launch(entry.name(), launch) {
            Ok(h) => h,
            Err(e) => panic!("launch failed: {e}"),
        };
        entry.update(|r| {
            r.state = LifecycleState::Stopping;
            r.handles.push(Arc::clone(&handle));
        });

        let teardown = TeardownReport {
            stopped: vec![SubsystemTag::Forwarder],
            failures: vec![TeardownFailure {
                tag: SubsystemTag::Resume,
                pid: handle.pid,
                reason: "still alive after SIGKILL".to_owned(),
            }],
        };
        commit_stop(entry, &teardown);

        let record = entry.snapshot();
        assert_eq!(record.state, LifecycleState::Stopped);
        assert!(record.handles.is_empty());
        assert!(
            record.last_error.as_deref().is_some_and(|e| e.contains("resume")),
            "{:?}",
            record.last_error
        );
        let _ = supervisor.terminate(&handle, std::time::Duration::from_secs(1)).await;
    }

    #[test]
    fn clean_teardown_leaves_last_error_alone() {
        let registry = InstanceRegistry::new(1);
        let guard = match registry.insert_new(spec("tidy")) {
            Ok(g) => g,
            Err(e) => panic!("insert failed: {e}"),
        };
        let entry = guard.entry();
        commit_stop(entry, &TeardownReport::default());

        let record = entry.snapshot();
        assert_eq!(record.state, LifecycleState::Stopped);
        assert_eq!(record.last_error, None);
        assert_eq!(record.name.as_str(), "tidy");
    }
}
