//! On-disk and network layout of one VM instance.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ark_core::PortForward;
use serde::{Deserialize, Serialize};

/// Artifacts the snapshotter writes into the package directory.
pub const PACKAGE_ARTIFACTS: [&str; 5] = ["state.bin", "memory.bin", "vmlinux", "rootfs.ext4", "config.json"];

/// Where an instance keeps its files and which network resources it owns.
///
/// ```text
/// <root>/
/// ├── blueprint/{vmlinux, rootfs.ext4}
/// ├── package/{state.bin, memory.bin, vmlinux, rootfs.ext4, config.json}
/// └── instance-0/{overlay, state}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLayout {
    /// Per-instance root directory.
    pub root: PathBuf,
    /// Namespace slot owned by the instance.
    pub slot: u16,
    /// Network namespace id, e.g. `ark0`.
    pub netns: String,
    /// Kernel image the snapshotter boots.
    pub kernel: PathBuf,
    /// Root disk the snapshotter boots.
    pub disk: PathBuf,
    /// Control endpoint of the resume process.
    pub resume_addr: SocketAddr,
    /// Port forwards installed by the forwarder.
    pub forwards: Vec<PortForward>,
}

impl InstanceLayout {
    /// Layout rooted at `root` with the blueprint inside it.
    #[must_use]
    pub fn new(
        root: PathBuf,
        slot: u16,
        netns: String,
        resume_addr: SocketAddr,
        forwards: Vec<PortForward>,
    ) -> Self {
        let blueprint = root.join("blueprint");
        Self {
            kernel: blueprint.join("vmlinux"),
            disk: blueprint.join("rootfs.ext4"),
            root,
            slot,
            netns,
            resume_addr,
            forwards,
        }
    }

    /// Point the kernel and disk at an already-extracted blueprint.
    #[must_use]
    pub fn with_blueprint(mut self, dir: &Path) -> Self {
        self.kernel = dir.join("vmlinux");
        self.disk = dir.join("rootfs.ext4");
        self
    }

    #[must_use]
    pub fn blueprint_dir(&self) -> PathBuf {
        self.root.join("blueprint")
    }

    #[must_use]
    pub fn package_dir(&self) -> PathBuf {
        self.root.join("package")
    }

    /// Path of one package artifact.
    #[must_use]
    pub fn package_artifact(&self, name: &str) -> PathBuf {
        self.package_dir().join(name)
    }

    /// All package artifacts, in [`PACKAGE_ARTIFACTS`] order.
    #[must_use]
    pub fn package_artifacts(&self) -> Vec<PathBuf> {
        PACKAGE_ARTIFACTS.iter().map(|a| self.package_artifact(a)).collect()
    }

    #[must_use]
    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join("instance-0").join("overlay")
    }

    #[must_use]
    pub fn instance_state_dir(&self) -> PathBuf {
        self.root.join("instance-0").join("state")
    }

    /// Every directory that must exist before the subsystems run.
    #[must_use]
    pub fn directories(&self) -> [PathBuf; 4] {
        [
            self.blueprint_dir(),
            self.package_dir(),
            self.overlay_dir(),
            self.instance_state_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> InstanceLayout {
        let addr = match "127.0.0.1:1337".parse() {
            Ok(a) => a,
            Err(e) => panic!("bad addr: {e}"),
        };
        InstanceLayout::new(PathBuf::from("/srv/ark/redis"), 0, "ark0".to_owned(), addr, Vec::new())
    }

    #[test]
    fn layout_places_everything_under_root() {
        let layout = layout();
        for dir in layout.directories() {
            assert!(dir.starts_with("/srv/ark/redis"), "{} escapes root", dir.display());
        }
        assert_eq!(layout.kernel, PathBuf::from("/srv/ark/redis/blueprint/vmlinux"));
        assert_eq!(layout.package_artifact("memory.bin"), PathBuf::from("/srv/ark/redis/package/memory.bin"));
        assert_eq!(layout.package_artifacts().len(), PACKAGE_ARTIFACTS.len());
    }

    #[test]
    fn with_blueprint_redirects_kernel_and_disk() {
        let layout = layout().with_blueprint(Path::new("/images/drafteros"));
        assert_eq!(layout.kernel, PathBuf::from("/images/drafteros/vmlinux"));
        assert_eq!(layout.disk, PathBuf::from("/images/drafteros/rootfs.ext4"));
        assert_eq!(layout.package_dir(), PathBuf::from("/srv/ark/redis/package"));
    }
}
