//! Subsystem supervision and VM lifecycle orchestration for Ark.
//!
//! Launches the Drafter toolkit's external subsystems as supervised
//! processes, confirms their readiness by polling rather than sleeping,
//! and sequences them through a per-instance lifecycle state machine.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod checks;
pub mod config;
pub mod drafter;
pub mod error;
pub mod handle;
pub mod layout;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use backend::{SubsystemBackend, SubsystemPlan};
pub use config::{OrchestratorConfig, ToolkitConfig};
pub use drafter::DrafterToolkit;
pub use error::ExecutorError;
pub use handle::{LaunchSpec, SubsystemHandle};
pub use layout::InstanceLayout;
pub use lifecycle::{MigrationStatus, StopOutcome, VmOrchestrator};
pub use probe::{await_ready, ProbePolicy, ReadinessCheck, ReadinessOutcome};
pub use registry::{InstanceEntry, InstanceRecord, InstanceRegistry, TransitionGuard};
pub use status::{InstanceStatus, InstanceSummary, SubsystemReport};
pub use supervisor::{ProcessSupervisor, TeardownFailure, TeardownReport};
