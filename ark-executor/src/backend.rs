//! Subsystem backend abstraction trait.
//!
//! Decouples the lifecycle state machine from the concrete toolkit that
//! provides the network, snapshot, resume and forwarding subsystems.

use std::sync::Arc;

use ark_core::{SubsystemTag, VmSpec};
use async_trait::async_trait;

use crate::{ExecutorError, InstanceLayout, LaunchSpec, ProbePolicy, ReadinessCheck};

/// Everything needed to launch one subsystem and confirm it is usable.
#[derive(Debug, Clone)]
pub struct SubsystemPlan {
    /// Program and arguments.
    pub launch: LaunchSpec,
    /// Readiness signal the prober waits for.
    pub check: Arc<dyn ReadinessCheck>,
    /// Polling parameters for that signal.
    pub policy: ProbePolicy,
}

/// Provider of the subsystems an instance is composed of.
///
/// # Cancel Safety
/// `prepare` may leave partially created directories behind if dropped;
/// they are recreated idempotently on the next attempt.
#[async_trait]
pub trait SubsystemBackend: Send + Sync + 'static {
    /// Create the instance's directories and resolve its layout for the
    /// given namespace slot. Extracts the blueprint when needed.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if directories cannot be created and
    /// [`ExecutorError::BlueprintFailed`] if extraction fails.
    async fn prepare(&self, spec: &VmSpec, slot: u16) -> Result<InstanceLayout, ExecutorError>;

    /// Describe how to launch `tag` for this instance.
    fn plan(&self, tag: SubsystemTag, spec: &VmSpec, layout: &InstanceLayout) -> SubsystemPlan;

    /// Check that the backend's binaries are present.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] for the first missing binary.
    async fn health_check(&self) -> Result<(), ExecutorError>;
}
