//! Error types for the executor crate.

use std::path::PathBuf;
use std::time::Duration;

use ark_core::{CoreError, LifecycleState, SubsystemStatus, SubsystemTag, VmName};

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The request failed validation.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// A subsystem binary could not be found.
    #[error("{tag} binary not found at {path}")]
    BinaryNotFound { tag: SubsystemTag, path: PathBuf },

    /// The OS refused to spawn a subsystem process.
    #[error("failed to launch {tag}: {source}")]
    LaunchFailed {
        tag: SubsystemTag,
        #[source]
        source: std::io::Error,
    },

    /// A subsystem was spawned but never became ready.
    #[error("{tag} did not become ready within {}ms", .waited.as_millis())]
    ReadinessTimeout { tag: SubsystemTag, waited: Duration },

    /// A subsystem exited before becoming ready.
    #[error("{tag} exited before becoming ready: {status}")]
    SubsystemCrashed { tag: SubsystemTag, status: SubsystemStatus },

    /// A subsystem survived both the graceful and the forced kill.
    #[error("{tag} (pid {pid}) could not be terminated: {reason}")]
    TerminateFailed {
        tag: SubsystemTag,
        pid: u32,
        reason: String,
    },

    /// Blueprint extraction from the image failed.
    #[error("blueprint extraction failed: {0}")]
    BlueprintFailed(String),

    /// The command is not valid in the instance's current state.
    #[error("cannot {operation} VM '{name}' in state {state}")]
    StateConflict {
        name: VmName,
        state: LifecycleState,
        operation: &'static str,
    },

    /// Another transition currently owns the instance.
    #[error("a transition is already in progress for VM '{0}'")]
    TransitionInProgress(VmName),

    /// A VM with this name already exists.
    #[error("VM '{0}' already exists")]
    AlreadyExists(VmName),

    /// No VM with this name is registered.
    #[error("VM not found: {0}")]
    NotFound(VmName),

    /// Every network namespace slot is taken.
    #[error("no free network namespace slot (limit {0})")]
    SlotsExhausted(u16),

    /// The background transition task panicked or was aborted.
    #[error("transition task aborted: {0}")]
    TaskAborted(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Semantic error category, stable across releases.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::BinaryNotFound { .. } | Self::LaunchFailed { .. } | Self::SubsystemCrashed { .. } => {
                "launch_error"
            }
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::StateConflict { .. } | Self::TransitionInProgress(_) | Self::AlreadyExists(_) => {
                "state_conflict"
            }
            Self::NotFound(_) => "not_found",
            Self::SlotsExhausted(_) => "resource_exhausted",
            Self::TerminateFailed { .. }
            | Self::BlueprintFailed(_)
            | Self::TaskAborted(_)
            | Self::Io(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> VmName {
        match VmName::new("redis") {
            Ok(n) => n,
            Err(e) => panic!("bad name: {e}"),
        }
    }

    #[test]
    fn kinds_separate_broken_binaries_from_slow_subsystems() {
        let launch = ExecutorError::LaunchFailed {
            tag: SubsystemTag::Network,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let timeout = ExecutorError::ReadinessTimeout {
            tag: SubsystemTag::Network,
            waited: Duration::from_secs(2),
        };
        assert_eq!(launch.kind(), "launch_error");
        assert_eq!(timeout.kind(), "readiness_timeout");
    }

    #[test]
    fn state_conflict_display_names_operation_and_state() {
        let err = ExecutorError::StateConflict {
            name: name(),
            state: LifecycleState::Stopped,
            operation: "start",
        };
        let msg = err.to_string();
        assert!(msg.contains("start"), "{msg}");
        assert!(msg.contains("STOPPED"), "{msg}");
        assert_eq!(err.kind(), "state_conflict");
    }

    #[test]
    fn readiness_timeout_display_reports_milliseconds() {
        let err = ExecutorError::ReadinessTimeout {
            tag: SubsystemTag::Resume,
            waited: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "resume did not become ready within 2500ms");
    }
}
