use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM instance.
///
/// ```text
/// CREATING ──▶ READY ──▶ STARTING ──▶ RUNNING ──▶ STOPPING ──▶ STOPPED
///     │                     │
///     └────────▶ FAILED ◀───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Network and snapshot subsystems are being brought up.
    Creating,
    /// The snapshot package exists; the VM can be started.
    Ready,
    /// Resume and forwarder subsystems are being brought up.
    Starting,
    /// All subsystems are live.
    Running,
    /// Subsystems are being torn down.
    Stopping,
    /// Torn down. Terminal.
    Stopped,
    /// A transition failed and its subsystems were torn down. Terminal,
    /// but may be retried.
    Failed,
}

impl LifecycleState {
    /// Returns `true` for `STOPPED` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns `true` while a transition owns the instance.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Creating | Self::Starting | Self::Stopping)
    }

    /// Upper-case name as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four external subsystems that together realize a running VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemTag {
    /// Network-namespace manager (`drafter-nat`).
    Network,
    /// Snapshot packager (`drafter-snapshotter`). Runs once and exits.
    Snapshotter,
    /// Resume/peer process (`drafter-peer`).
    Resume,
    /// Port forwarder (`drafter-forwarder`).
    Forwarder,
}

impl SubsystemTag {
    /// All tags in launch order.
    pub const ALL: [Self; 4] = [Self::Network, Self::Snapshotter, Self::Resume, Self::Forwarder];

    /// Returns `true` for subsystems that finish their work and exit
    /// instead of running as a daemon.
    #[must_use]
    pub const fn is_one_shot(self) -> bool {
        matches!(self, Self::Snapshotter)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Snapshotter => "snapshotter",
            Self::Resume => "resume",
            Self::Forwarder => "forwarder",
        }
    }
}

impl fmt::Display for SubsystemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of a launched subsystem process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubsystemStatus {
    /// Spawned, readiness not yet confirmed.
    Launching,
    /// Readiness confirmed.
    Ready,
    /// Process is alive.
    Running,
    /// Process exited on its own.
    Exited {
        /// Exit code reported by the OS.
        code: i32,
    },
    /// Process was terminated by a signal.
    Crashed {
        /// Terminating signal number, if known.
        signal: Option<i32>,
    },
}

impl SubsystemStatus {
    /// Returns `true` if the process has not exited.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Launching | Self::Ready | Self::Running)
    }

    /// Whether this status counts as healthy for the given subsystem.
    ///
    /// Daemons must be alive; a one-shot subsystem is healthy once it has
    /// exited with code 0.
    #[must_use]
    pub const fn is_healthy_for(self, tag: SubsystemTag) -> bool {
        if tag.is_one_shot() {
            matches!(self, Self::Exited { code: 0 })
        } else {
            self.is_alive()
        }
    }
}

impl fmt::Display for SubsystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launching => f.write_str("LAUNCHING"),
            Self::Ready => f.write_str("READY"),
            Self::Running => f.write_str("RUNNING"),
            Self::Exited { code } => write!(f, "EXITED({code})"),
            Self::Crashed { signal: Some(signal) } => write!(f, "CRASHED(signal {signal})"),
            Self::Crashed { signal: None } => f.write_str("CRASHED"),
        }
    }
}
