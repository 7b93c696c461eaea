//! Status aggregation: point-in-time liveness snapshots.

use ark_core::{LifecycleState, SubsystemStatus, SubsystemTag, VmName};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::{InstanceRecord, ProcessSupervisor};

/// Liveness of one owned subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemReport {
    pub tag: SubsystemTag,
    pub status: SubsystemStatus,
    pub healthy: bool,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Name and state of one instance, as listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub name: VmName,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
}

impl From<&InstanceRecord> for InstanceSummary {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            name: record.name.clone(),
            state: record.state,
            created_at: record.created_at,
        }
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub name: VmName,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub subsystems: Vec<SubsystemReport>,
}

impl InstanceStatus {
    /// Poll every handle the record owns and build a snapshot.
    ///
    /// Only uses the supervisor's non-blocking poll.
    #[must_use]
    pub fn collect(supervisor: &ProcessSupervisor, record: &InstanceRecord) -> Self {
        let subsystems = record
            .handles
            .iter()
            .map(|handle| {
                let status = supervisor.poll(handle);
                SubsystemReport {
                    tag: handle.tag,
                    status,
                    healthy: status.is_healthy_for(handle.tag),
                    pid: handle.pid,
                    started_at: handle.started_at,
                }
            })
            .collect();

        Self {
            name: record.name.clone(),
            state: record.state,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            subsystems,
        }
    }

    /// Whether the most recent launch of `tag` is healthy. `false` if it
    /// was never launched.
    #[must_use]
    pub fn is_healthy(&self, tag: SubsystemTag) -> bool {
        self.subsystems
            .iter()
            .rev()
            .find(|r| r.tag == tag)
            .is_some_and(|r| r.healthy)
    }

    /// Health of every subsystem kind, in launch order.
    #[must_use]
    pub fn health(&self) -> IndexMap<SubsystemTag, bool> {
        SubsystemTag::ALL
            .into_iter()
            .map(|tag| (tag, self.is_healthy(tag)))
            .collect()
    }

    /// Returns `true` when every subsystem kind is healthy.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        SubsystemTag::ALL.into_iter().all(|tag| self.is_healthy(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(tag: SubsystemTag, status: SubsystemStatus) -> SubsystemReport {
        SubsystemReport {
            tag,
            status,
            healthy: status.is_healthy_for(tag),
            pid: Some(42),
            started_at: Utc::now(),
        }
    }

    fn status(subsystems: Vec<SubsystemReport>) -> InstanceStatus {
        InstanceStatus {
            name: match VmName::new("agg") {
                Ok(n) => n,
                Err(e) => panic!("bad name: {e}"),
            },
            state: LifecycleState::Running,
            last_error: None,
            created_at: Utc::now(),
            subsystems,
        }
    }

    #[test]
    fn missing_subsystems_are_unhealthy() {
        let status = status(vec![report(SubsystemTag::Network, SubsystemStatus::Running)]);
        let health = status.health();
        assert_eq!(health.get(&SubsystemTag::Network), Some(&true));
        assert_eq!(health.get(&SubsystemTag::Resume), Some(&false));
        assert!(!status.all_healthy());
    }

    #[test]
    fn completed_snapshotter_counts_as_healthy() {
        let status = status(vec![
            report(SubsystemTag::Network, SubsystemStatus::Running),
            report(SubsystemTag::Snapshotter, SubsystemStatus::Exited { code: 0 }),
            report(SubsystemTag::Resume, SubsystemStatus::Ready),
            report(SubsystemTag::Forwarder, SubsystemStatus::Running),
        ]);
        assert!(status.all_healthy());

        let crashed = status_with_forwarder(SubsystemStatus::Crashed { signal: Some(9) });
        assert!(!crashed.is_healthy(SubsystemTag::Forwarder));
    }

    fn status_with_forwarder(forwarder: SubsystemStatus) -> InstanceStatus {
        status(vec![report(SubsystemTag::Forwarder, forwarder)])
    }

    #[test]
    fn health_serializes_as_tag_keyed_object() {
        let status = status(vec![report(SubsystemTag::Network, SubsystemStatus::Running)]);
        let json = match serde_json::to_value(status.health()) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {e}"),
        };
        assert_eq!(
            json,
            serde_json::json!({ "network": true, "snapshotter": false, "resume": false, "forwarder": false })
        );
    }
}
