//! Process supervisor for external subsystem processes.
//!
//! Launches subsystems detached from the caller, tracks their liveness
//! without ever awaiting completion, and tears them down with a
//! SIGTERM → SIGKILL escalation aimed at the whole process group.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ark_core::{SubsystemId, SubsystemStatus, SubsystemTag, VmName};
use indexmap::IndexMap;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::{ExecutorError, LaunchSpec, SubsystemHandle};

/// How often `terminate` re-checks a process it has signalled.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// One subsystem that could not be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub tag: SubsystemTag,
    pub pid: Option<u32>,
    pub reason: String,
}

/// Outcome of a best-effort teardown of several subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Subsystems confirmed dead, in teardown order.
    pub stopped: Vec<SubsystemTag>,
    /// Subsystems that refused to die.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Returns `true` if every subsystem was torn down.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Launches and supervises subsystem processes.
///
/// The handle table is only locked for short, non-blocking sections; the
/// per-process state lives in each [`SubsystemHandle`].
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    handles: Mutex<IndexMap<SubsystemId, Arc<SubsystemHandle>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor with an empty handle table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a subsystem process on behalf of `owner`.
    ///
    /// The process runs in its own process group with `kill_on_drop`
    /// disabled, so it outlives the request that launched it. Its stdout
    /// and stderr are forwarded to `tracing` at debug level.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] if the program cannot be
    /// resolved, or [`ExecutorError::LaunchFailed`] if spawning fails.
    pub fn launch(
        &self,
        owner: &VmName,
        spec: LaunchSpec,
    ) -> Result<Arc<SubsystemHandle>, ExecutorError> {
        let tag = spec.tag;
        which_binary(tag, &spec.program)?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .process_group(0)
            .spawn()
            .map_err(|source| ExecutorError::LaunchFailed { tag, source })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, owner.clone(), tag, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, owner.clone(), tag, "stderr");
        }

        let handle = Arc::new(SubsystemHandle::new(owner.clone(), spec, child));
        tracing::info!(
            vm = %owner,
            %tag,
            pid = ?handle.pid,
            command = %handle.spec,
            "subsystem launched"
        );

        self.table().insert(handle.id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Inspect the live process without blocking on it.
    ///
    /// Returns [`SubsystemStatus::Running`] while the process is alive and
    /// `Exited`/`Crashed` once it is gone. Exit is recorded on the handle.
    pub fn poll(&self, handle: &SubsystemHandle) -> SubsystemStatus {
        let mut slot = handle.slot();
        if !slot.status.is_alive() {
            return slot.status;
        }
        let Some(child) = slot.child.as_mut() else {
            return slot.status;
        };
        match child.try_wait() {
            Ok(None) => SubsystemStatus::Running,
            Ok(Some(exit)) => {
                let status = exit_to_status(exit);
                slot.status = status;
                tracing::info!(vm = %handle.owner, tag = %handle.tag, pid = ?handle.pid, %status, "subsystem exited");
                status
            }
            Err(e) => {
                tracing::warn!(vm = %handle.owner, tag = %handle.tag, error = %e, "failed to poll subsystem");
                SubsystemStatus::Running
            }
        }
    }

    /// Terminate one subsystem: SIGTERM, then SIGKILL after `grace`.
    ///
    /// Terminating an already-exited handle is a no-op. Once the leader is
    /// gone the handle leaves the supervisor's table and the rest of its
    /// process group is sent SIGKILL, so helpers that outlive the leader do
    /// not keep holding ports or namespaces.
    ///
    /// # Errors
    /// Returns [`ExecutorError::TerminateFailed`] if the process is still
    /// alive after the forced kill.
    pub async fn terminate(
        &self,
        handle: &SubsystemHandle,
        grace: Duration,
    ) -> Result<(), ExecutorError> {
        if !self.poll(handle).is_alive() {
            self.release(handle);
            return Ok(());
        }

        tracing::info!(vm = %handle.owner, tag = %handle.tag, pid = ?handle.pid, "terminating subsystem");
        self.signal(handle, Signal::SIGTERM);

        if self.wait_for_exit(handle, grace).await {
            self.release(handle);
            return Ok(());
        }

        tracing::warn!(
            vm = %handle.owner,
            tag = %handle.tag,
            pid = ?handle.pid,
            grace_ms = grace.as_millis(),
            "subsystem ignored SIGTERM, escalating to SIGKILL"
        );
        self.signal(handle, Signal::SIGKILL);
        if let Some(child) = handle.slot().child.as_mut() {
            let _ = child.start_kill();
        }

        if self.wait_for_exit(handle, KILL_REAP_TIMEOUT).await {
            self.release(handle);
            return Ok(());
        }

        Err(ExecutorError::TerminateFailed {
            tag: handle.tag,
            pid: handle.pid.unwrap_or_default(),
            reason: "still alive after SIGKILL".to_owned(),
        })
    }

    /// Terminate the given handles in order, continuing past failures.
    pub async fn terminate_many(
        &self,
        handles: &[Arc<SubsystemHandle>],
        grace: Duration,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        for handle in handles {
            match self.terminate(handle, grace).await {
                Ok(()) => report.stopped.push(handle.tag),
                Err(e) => {
                    tracing::error!(vm = %handle.owner, tag = %handle.tag, error = %e, "teardown failed");
                    report.failures.push(TeardownFailure {
                        tag: handle.tag,
                        pid: handle.pid,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Terminate every tracked handle matching `tag_filter`, newest first.
    pub async fn terminate_all(
        &self,
        tag_filter: Option<SubsystemTag>,
        grace: Duration,
    ) -> TeardownReport {
        let targets: Vec<_> = self
            .tracked()
            .into_iter()
            .rev()
            .filter(|h| tag_filter.is_none_or(|tag| h.tag == tag))
            .collect();
        self.terminate_many(&targets, grace).await
    }

    /// Handles currently tracked, in launch order.
    #[must_use]
    pub fn tracked(&self) -> Vec<Arc<SubsystemHandle>> {
        self.table().values().cloned().collect()
    }

    /// Number of handles currently tracked.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, IndexMap<SubsystemId, Arc<SubsystemHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a dead leader from the table and kill whatever is left of its
    /// group. Only the first release of a handle signals the group.
    fn release(&self, handle: &SubsystemHandle) {
        let tracked = self.table().shift_remove(&handle.id).is_some();
        if tracked {
            self.signal(handle, Signal::SIGKILL);
        }
    }

    fn signal(&self, handle: &SubsystemHandle, signal: Signal) {
        let Some(pgid) = handle.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(tag = %handle.tag, pgid, signal = ?signal, error = %e, "failed to signal subsystem");
            }
        }
    }

    async fn wait_for_exit(&self, handle: &SubsystemHandle, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.poll(handle).is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        }
    }
}

fn exit_to_status(exit: ExitStatus) -> SubsystemStatus {
    match exit.code() {
        Some(code) => SubsystemStatus::Exited { code },
        None => SubsystemStatus::Crashed {
            signal: exit.signal(),
        },
    }
}

fn forward_output<R>(reader: R, owner: VmName, tag: SubsystemTag, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(vm = %owner, %tag, stream, "{line}");
        }
    });
}

/// Verify a binary exists either at the given path or in PATH.
pub(crate) fn which_binary(tag: SubsystemTag, path: &Path) -> Result<(), ExecutorError> {
    if path.is_absolute() || path.components().count() > 1 {
        if path.is_file() {
            return Ok(());
        }
        return Err(ExecutorError::BinaryNotFound { tag, path: path.to_owned() });
    }

    // Bare name: check PATH
    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(path).is_file()))
        .unwrap_or(false);

    if found {
        Ok(())
    } else {
        Err(ExecutorError::BinaryNotFound { tag, path: path.to_owned() })
    }
}
