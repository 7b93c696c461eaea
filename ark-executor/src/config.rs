//! Toolkit and orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ProbePolicy;

/// How to drive the Drafter toolkit binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ToolkitConfig {
    /// Directory holding the `drafter-*` binaries. `None` resolves them
    /// through `$PATH`.
    pub bin_dir: Option<PathBuf>,

    /// Root directory for per-instance blueprints, packages and state.
    pub state_dir: PathBuf,

    /// Host interface `drafter-nat` routes guest traffic through.
    pub host_interface: String,

    /// Prefix of per-instance network namespace names (`ark0`, `ark1`, ...).
    pub netns_prefix: String,

    /// Directory where named network namespaces are mounted.
    pub netns_dir: PathBuf,

    /// CPU template passed to the snapshotter.
    pub cpu_template: String,

    /// Resume control port for slot 0; slot N listens on `base + N`.
    pub resume_base_port: u16,

    /// Remote peer address for `drafter-peer --raddr`. Empty resumes from
    /// the local package.
    pub resume_remote_addr: String,

    /// Host port of the default forward for slot 0; slot N uses `base + N`.
    pub forward_base_port: u16,

    /// Guest port exposed by the default forward.
    pub forward_internal_port: u16,

    /// Readiness polling for the long-running daemons.
    pub readiness: ProbePolicy,

    /// Readiness polling for snapshot packaging, which boots the guest once
    /// and can take minutes.
    pub snapshot: ProbePolicy,

    /// Upper bound for blueprint extraction.
    pub blueprint_timeout: Duration,
}

impl ToolkitConfig {
    /// Create a config rooted at `state_dir` with defaults for everything else.
    #[must_use]
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            bin_dir: None,
            state_dir,
            host_interface: "eth0".to_owned(),
            netns_prefix: "ark".to_owned(),
            netns_dir: PathBuf::from("/var/run/netns"),
            cpu_template: "T2A".to_owned(),
            resume_base_port: 1337,
            resume_remote_addr: String::new(),
            forward_base_port: 3333,
            forward_internal_port: 6379,
            readiness: ProbePolicy::new(Duration::from_millis(50), Duration::from_secs(60)),
            snapshot: ProbePolicy::new(Duration::from_millis(250), Duration::from_secs(600))
                .with_max_interval(Duration::from_secs(2)),
            blueprint_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("out"))
    }
}

/// Orchestrator-wide limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OrchestratorConfig {
    /// How long a subsystem gets to exit after SIGTERM before SIGKILL.
    pub grace_period: Duration,

    /// Maximum number of registered instances (namespace slots).
    pub max_instances: u16,
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn new(grace_period: Duration, max_instances: u16) -> Self {
        Self { grace_period, max_instances }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 64)
    }
}
