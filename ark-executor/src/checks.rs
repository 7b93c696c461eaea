//! Readiness checks for the Drafter subsystems.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ark_core::SubsystemStatus;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::{ReadinessCheck, SubsystemHandle};

/// Per-address connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// The network namespace handle file exists.
///
/// `drafter-nat` creates one bind-mounted handle per namespace under the
/// netns directory once the namespace and its veth pair are configured.
#[derive(Debug, Clone)]
pub struct NetnsPresent {
    pub path: PathBuf,
}

#[async_trait]
impl ReadinessCheck for NetnsPresent {
    async fn is_ready(&self, _handle: &SubsystemHandle, status: SubsystemStatus) -> bool {
        status.is_alive() && tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}

/// A one-shot subsystem exited cleanly and left its artifacts behind.
#[derive(Debug, Clone)]
pub struct CompletedWithArtifacts {
    pub artifacts: Vec<PathBuf>,
}

#[async_trait]
impl ReadinessCheck for CompletedWithArtifacts {
    async fn is_ready(&self, _handle: &SubsystemHandle, status: SubsystemStatus) -> bool {
        if status != (SubsystemStatus::Exited { code: 0 }) {
            return false;
        }
        for artifact in &self.artifacts {
            if !tokio::fs::try_exists(artifact).await.unwrap_or(false) {
                tracing::warn!(artifact = %artifact.display(), "expected artifact missing");
                return false;
            }
        }
        true
    }
}

/// Every address accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpAccepting {
    pub addrs: Vec<SocketAddr>,
}

#[async_trait]
impl ReadinessCheck for TcpAccepting {
    async fn is_ready(&self, _handle: &SubsystemHandle, status: SubsystemStatus) -> bool {
        if !status.is_alive() {
            return false;
        }
        for addr in &self.addrs {
            let connected = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(*addr))
                .await
                .is_ok_and(|r| r.is_ok());
            if !connected {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ark_core::{SubsystemTag, VmName};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{LaunchSpec, ProcessSupervisor};

    fn sleeper(sup: &ProcessSupervisor) -> Arc<SubsystemHandle> {
        let owner = match VmName::new("checks") {
            Ok(n) => n,
            Err(e) => panic!("bad name: {e}"),
        };
        match sup.launch(&owner, LaunchSpec::new(SubsystemTag::Forwarder, "sleep").arg("30")) {
            Ok(h) => h,
            Err(e) => panic!("launch failed: {e}"),
        }
    }

    #[tokio::test]
    async fn tcp_accepting_tracks_listener() {
        let sup = ProcessSupervisor::new();
        let handle = sleeper(&sup);

        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        let addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => panic!("local_addr failed: {e}"),
        };
        let check = TcpAccepting { addrs: vec![addr] };
        assert!(check.is_ready(&handle, SubsystemStatus::Running).await);

        drop(listener);
        assert!(!check.is_ready(&handle, SubsystemStatus::Running).await, "closed port must not be ready");
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn tcp_accepting_requires_live_process() {
        let sup = ProcessSupervisor::new();
        let handle = sleeper(&sup);
        let check = TcpAccepting { addrs: Vec::new() };
        assert!(check.is_ready(&handle, SubsystemStatus::Running).await);
        assert!(!check.is_ready(&handle, SubsystemStatus::Exited { code: 0 }).await);
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn completed_with_artifacts_needs_clean_exit_and_files() {
        let sup = ProcessSupervisor::new();
        let handle = sleeper(&sup);
        let dir = std::env::temp_dir().join(format!("ark-checks-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            panic!("mkdir failed: {e}");
        }
        let artifact = dir.join("memory.bin");
        let check = CompletedWithArtifacts { artifacts: vec![artifact.clone()] };

        let clean = SubsystemStatus::Exited { code: 0 };
        assert!(!check.is_ready(&handle, clean).await, "missing artifact must fail");

        if let Err(e) = tokio::fs::write(&artifact, b"mem").await {
            panic!("write failed: {e}");
        }
        assert!(check.is_ready(&handle, clean).await);
        assert!(!check.is_ready(&handle, SubsystemStatus::Exited { code: 1 }).await);
        assert!(!check.is_ready(&handle, SubsystemStatus::Running).await, "still packaging");

        let _ = tokio::fs::remove_dir_all(&dir).await;
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn netns_present_checks_handle_file() {
        let sup = ProcessSupervisor::new();
        let handle = sleeper(&sup);
        let path = std::env::temp_dir().join(format!("ark-netns-{}", uuid::Uuid::new_v4()));
        let check = NetnsPresent { path: path.clone() };

        assert!(!check.is_ready(&handle, SubsystemStatus::Running).await);
        if let Err(e) = tokio::fs::write(&path, b"").await {
            panic!("write failed: {e}");
        }
        assert!(check.is_ready(&handle, SubsystemStatus::Running).await);
        assert!(!check.is_ready(&handle, SubsystemStatus::Crashed { signal: Some(9) }).await);

        let _ = tokio::fs::remove_file(&path).await;
        let _ = sup.terminate(&handle, Duration::from_secs(1)).await;
    }
}
