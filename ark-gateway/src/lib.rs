//! HTTP control plane for Ark VM instances.
//!
//! Accepts lifecycle commands for named VMs, drives them through the
//! executor's orchestrator and reports per-subsystem health.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod routes;
