//! Core types for the Ark VM lifecycle control plane.
//!
//! Defines the vocabulary shared by the orchestrator and the HTTP gateway:
//! VM names, lifecycle states, subsystem tags and statuses, and validated
//! VM specifications.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod id;
pub mod lifecycle;
pub mod machine;

pub use error::CoreError;
pub use id::{SubsystemId, VmName};
pub use lifecycle::{LifecycleState, SubsystemStatus, SubsystemTag};
pub use machine::{parse_size_mib, PortForward, Protocol, VmSpec};
