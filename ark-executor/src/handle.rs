//! Subsystem handle: one launched external process.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ark_core::{SubsystemId, SubsystemStatus, SubsystemTag, VmName};
use chrono::{DateTime, Utc};
use tokio::process::Child;

/// What to run for one subsystem: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Which subsystem this process realizes.
    pub tag: SubsystemTag,
    /// Executable path or bare name resolved through `$PATH`.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Create a launch spec with no arguments.
    #[must_use]
    pub fn new(tag: SubsystemTag, program: impl Into<PathBuf>) -> Self {
        Self {
            tag,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag` in the argument list, if present.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub(crate) struct ProcessSlot {
    pub(crate) child: Option<Child>,
    pub(crate) status: SubsystemStatus,
}

/// A handle to a launched subsystem process.
///
/// Dropping this handle does NOT terminate the process. Call
/// [`ProcessSupervisor::terminate`](crate::ProcessSupervisor::terminate)
/// explicitly. The process state sits behind a per-handle lock so that
/// polling from a status request can race with a background transition.
#[non_exhaustive]
pub struct SubsystemHandle {
    /// Unique identifier for this launch.
    pub id: SubsystemId,

    /// Which subsystem this process realizes.
    pub tag: SubsystemTag,

    /// VM instance that owns this process.
    pub owner: VmName,

    /// OS process ID, also the process group ID.
    pub pid: Option<u32>,

    /// What was launched.
    pub spec: LaunchSpec,

    /// Timestamp when the process was spawned.
    pub started_at: DateTime<Utc>,

    process: Mutex<ProcessSlot>,
}

impl SubsystemHandle {
    pub(crate) fn new(owner: VmName, spec: LaunchSpec, child: Child) -> Self {
        Self {
            id: SubsystemId::new(),
            tag: spec.tag,
            owner,
            pid: child.id(),
            spec,
            started_at: Utc::now(),
            process: Mutex::new(ProcessSlot {
                child: Some(child),
                status: SubsystemStatus::Launching,
            }),
        }
    }

    /// Last status recorded by the supervisor or prober.
    ///
    /// Does not touch the process; use
    /// [`ProcessSupervisor::poll`](crate::ProcessSupervisor::poll) for a
    /// fresh reading.
    #[must_use]
    pub fn observed(&self) -> SubsystemStatus {
        self.slot().status
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, ProcessSlot> {
        // The slot holds no invariants a panicking holder could break.
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that readiness was confirmed, unless the process already exited.
    pub(crate) fn mark_ready(&self) {
        let mut slot = self.slot();
        if slot.status.is_alive() {
            slot.status = SubsystemStatus::Ready;
        }
    }
}

impl fmt::Debug for SubsystemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubsystemHandle")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("owner", &self.owner)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("status", &self.observed())
            .finish_non_exhaustive()
    }
}
