//! Drafter toolkit backend.
//!
//! Maps each subsystem onto its `drafter-*` binary: argument schemas, the
//! readiness signal to wait for, and blueprint extraction through
//! `drafter-packager`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use ark_core::{PortForward, Protocol, SubsystemTag, VmSpec};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::backend::{SubsystemBackend, SubsystemPlan};
use crate::checks::{CompletedWithArtifacts, NetnsPresent, TcpAccepting};
use crate::supervisor::which_binary;
use crate::{ExecutorError, InstanceLayout, LaunchSpec, ToolkitConfig};

const PACKAGER: &str = "drafter-packager";

/// Bytes of packager stderr kept in a [`ExecutorError::BlueprintFailed`].
const STDERR_TAIL: usize = 2048;

/// Block size for the resume process's migratable devices.
const RESUME_BLOCK_SIZE: u32 = 64 * 1024;

/// Backend driving the Drafter command-line toolkit.
#[derive(Debug, Clone)]
pub struct DrafterToolkit {
    config: ToolkitConfig,
}

impl DrafterToolkit {
    #[must_use]
    pub fn new(config: ToolkitConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    /// Path to a toolkit binary, resolved through `bin_dir` when set.
    #[must_use]
    pub fn binary(&self, name: &str) -> PathBuf {
        match &self.config.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Binary name of a subsystem.
    #[must_use]
    pub fn binary_name(tag: SubsystemTag) -> &'static str {
        match tag {
            SubsystemTag::Network => "drafter-nat",
            SubsystemTag::Snapshotter => "drafter-snapshotter",
            SubsystemTag::Resume => "drafter-peer",
            SubsystemTag::Forwarder => "drafter-forwarder",
        }
    }

    /// Namespace id for a slot, e.g. `ark3`.
    #[must_use]
    pub fn netns_for(&self, slot: u16) -> String {
        format!("{}{slot}", self.config.netns_prefix)
    }

    /// Layout of an instance without creating anything on disk.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SlotsExhausted`] if the slot pushes a
    /// derived port past `u16::MAX`.
    pub fn layout_for(&self, spec: &VmSpec, slot: u16) -> Result<InstanceLayout, ExecutorError> {
        let resume_port = self
            .config
            .resume_base_port
            .checked_add(slot)
            .ok_or(ExecutorError::SlotsExhausted(slot))?;
        let resume_addr = SocketAddr::from(([127, 0, 0, 1], resume_port));

        let forwards = if spec.port_forwards.is_empty() {
            let external_port = self
                .config
                .forward_base_port
                .checked_add(slot)
                .ok_or(ExecutorError::SlotsExhausted(slot))?;
            vec![PortForward {
                internal_port: self.config.forward_internal_port,
                protocol: Protocol::Tcp,
                external_addr: SocketAddr::from(([127, 0, 0, 1], external_port)),
            }]
        } else {
            spec.port_forwards.clone()
        };

        let root = self.config.state_dir.join(spec.name.as_str());
        let layout = InstanceLayout::new(root, slot, self.netns_for(slot), resume_addr, forwards);
        Ok(if is_blueprint_dir(&spec.image_path) {
            layout.with_blueprint(&spec.image_path)
        } else {
            layout
        })
    }

    fn network_plan(&self, layout: &InstanceLayout) -> SubsystemPlan {
        let launch = LaunchSpec::new(SubsystemTag::Network, self.binary("drafter-nat"))
            .args(["--host-interface", self.config.host_interface.as_str()]);
        SubsystemPlan {
            launch,
            check: Arc::new(NetnsPresent { path: self.config.netns_dir.join(&layout.netns) }),
            policy: self.config.readiness,
        }
    }

    fn snapshotter_plan(&self, spec: &VmSpec, layout: &InstanceLayout) -> SubsystemPlan {
        let devices = json!([
            { "name": "state", "output": layout.package_artifact("state.bin") },
            { "name": "memory", "output": layout.package_artifact("memory.bin") },
            { "name": "kernel", "input": layout.kernel, "output": layout.package_artifact("vmlinux") },
            { "name": "disk", "input": layout.disk, "output": layout.package_artifact("rootfs.ext4") },
            { "name": "config", "output": layout.package_artifact("config.json") },
        ]);
        let launch = LaunchSpec::new(SubsystemTag::Snapshotter, self.binary("drafter-snapshotter")).args([
            "--netns".to_owned(),
            layout.netns.clone(),
            "--cpu-template".to_owned(),
            self.config.cpu_template.clone(),
            "--cpu-count".to_owned(),
            spec.cpus.to_string(),
            "--memory-size".to_owned(),
            spec.memory_mib.to_string(),
            "--devices".to_owned(),
            devices.to_string(),
        ]);
        SubsystemPlan {
            launch,
            check: Arc::new(CompletedWithArtifacts { artifacts: layout.package_artifacts() }),
            policy: self.config.snapshot,
        }
    }

    fn resume_plan(&self, layout: &InstanceLayout) -> SubsystemPlan {
        let overlay = layout.overlay_dir();
        let state = layout.instance_state_dir();
        let devices: Vec<_> = ["state", "memory", "kernel", "disk", "config"]
            .into_iter()
            .zip(crate::layout::PACKAGE_ARTIFACTS)
            .map(|(name, file)| {
                json!({
                    "name": name,
                    "base": layout.package_artifact(file),
                    "overlay": overlay.join(file),
                    "state": state.join(file),
                    "blockSize": RESUME_BLOCK_SIZE,
                    "makeMigratable": true,
                    "shared": false,
                })
            })
            .collect();
        let launch = LaunchSpec::new(SubsystemTag::Resume, self.binary("drafter-peer")).args([
            "--netns".to_owned(),
            layout.netns.clone(),
            "--raddr".to_owned(),
            self.config.resume_remote_addr.clone(),
            "--laddr".to_owned(),
            layout.resume_addr.to_string(),
            "--devices".to_owned(),
            serde_json::Value::Array(devices).to_string(),
        ]);
        SubsystemPlan {
            launch,
            check: Arc::new(TcpAccepting { addrs: vec![layout.resume_addr] }),
            policy: self.config.readiness,
        }
    }

    fn forwarder_plan(&self, layout: &InstanceLayout) -> SubsystemPlan {
        let forwards: Vec<_> = layout
            .forwards
            .iter()
            .map(|f| {
                json!({
                    "netns": layout.netns,
                    "internalPort": f.internal_port.to_string(),
                    "protocol": f.protocol.to_string(),
                    "externalAddr": f.external_addr.to_string(),
                })
            })
            .collect();
        let launch = LaunchSpec::new(SubsystemTag::Forwarder, self.binary("drafter-forwarder"))
            .args(["--port-forwards".to_owned(), serde_json::Value::Array(forwards).to_string()]);

        // UDP forwards have no listener we can probe; liveness is enough.
        let addrs = layout
            .forwards
            .iter()
            .filter(|f| f.protocol == Protocol::Tcp)
            .map(|f| f.external_addr)
            .collect();
        SubsystemPlan {
            launch,
            check: Arc::new(TcpAccepting { addrs }),
            policy: self.config.readiness,
        }
    }

    /// Extract the kernel and root disk from an image archive.
    ///
    /// Runs `drafter-packager --extract` to completion, bounded by
    /// `blueprint_timeout`. The packager is killed if the wait is abandoned.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BlueprintFailed`] if the packager is missing,
    /// times out, or exits unsuccessfully (with the tail of its stderr).
    pub async fn extract_blueprint(&self, image: &Path, layout: &InstanceLayout) -> Result<(), ExecutorError> {
        let packager = self.binary(PACKAGER);
        which_binary(SubsystemTag::Snapshotter, &packager)
            .map_err(|_| ExecutorError::BlueprintFailed(format!("{} not found", packager.display())))?;

        let devices = json!([
            { "name": "kernel", "path": layout.kernel },
            { "name": "disk", "path": layout.disk },
        ]);
        tracing::info!(image = %image.display(), dest = %layout.blueprint_dir().display(), "extracting blueprint");

        let child = Command::new(&packager)
            .arg("--package-path")
            .arg(image)
            .arg("--extract")
            .arg("--devices")
            .arg(devices.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::BlueprintFailed(format!("exec {PACKAGER}: {e}")))?;

        let output = tokio::time::timeout(self.config.blueprint_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ExecutorError::BlueprintFailed(format!(
                    "{PACKAGER} did not finish within {}s",
                    self.config.blueprint_timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::BlueprintFailed(format!(
                "{PACKAGER} exited with {}: {}",
                output.status,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SubsystemBackend for DrafterToolkit {
    async fn prepare(&self, spec: &VmSpec, slot: u16) -> Result<InstanceLayout, ExecutorError> {
        let layout = self.layout_for(spec, slot)?;
        for dir in layout.directories() {
            tokio::fs::create_dir_all(&dir).await?;
        }

        if is_blueprint_dir(&spec.image_path) {
            tracing::debug!(vm = %spec.name, image = %spec.image_path.display(), "using extracted blueprint");
        } else {
            self.extract_blueprint(&spec.image_path, &layout).await?;
        }
        Ok(layout)
    }

    fn plan(&self, tag: SubsystemTag, spec: &VmSpec, layout: &InstanceLayout) -> SubsystemPlan {
        match tag {
            SubsystemTag::Network => self.network_plan(layout),
            SubsystemTag::Snapshotter => self.snapshotter_plan(spec, layout),
            SubsystemTag::Resume => self.resume_plan(layout),
            SubsystemTag::Forwarder => self.forwarder_plan(layout),
        }
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        for tag in SubsystemTag::ALL {
            which_binary(tag, &self.binary(Self::binary_name(tag)))?;
        }
        let packager = self.binary(PACKAGER);
        which_binary(SubsystemTag::Snapshotter, &packager)
            .map_err(|_| ExecutorError::BlueprintFailed(format!("{} not found", packager.display())))
    }
}

/// A directory that already holds `vmlinux` and `rootfs.ext4`.
fn is_blueprint_dir(path: &Path) -> bool {
    path.is_dir() && path.join("vmlinux").is_file() && path.join("rootfs.ext4").is_file()
}

/// The last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn spec(name: &str, image: &Path) -> VmSpec {
        match VmSpec::parse(name, "2048", 2, "4G", &image.to_string_lossy()) {
            Ok(s) => s,
            Err(e) => panic!("bad spec: {e}"),
        }
    }

    fn toolkit(state_dir: &Path) -> DrafterToolkit {
        let mut config = ToolkitConfig::new(state_dir.to_owned());
        config.bin_dir = Some(PathBuf::from("/opt/drafter/bin"));
        DrafterToolkit::new(config)
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    fn layout(toolkit: &DrafterToolkit, spec: &VmSpec, slot: u16) -> InstanceLayout {
        match toolkit.layout_for(spec, slot) {
            Ok(l) => l,
            Err(e) => panic!("layout failed: {e}"),
        }
    }

    #[test]
    fn slots_get_distinct_namespaces_and_ports() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));

        let first = layout(&toolkit, &spec, 0);
        let second = layout(&toolkit, &spec, 3);

        assert_eq!(first.netns, "ark0");
        assert_eq!(second.netns, "ark3");
        assert_eq!(first.resume_addr.port(), 1337);
        assert_eq!(second.resume_addr.port(), 1340);
        assert_eq!(first.forwards[0].external_addr.port(), 3333);
        assert_eq!(second.forwards[0].external_addr.port(), 3336);
        assert_eq!(second.forwards[0].internal_port, 6379);
        assert_eq!(first.root, PathBuf::from("/srv/ark/redis"));
    }

    #[test]
    fn port_overflow_is_slots_exhausted() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));
        assert!(matches!(
            toolkit.layout_for(&spec, u16::MAX),
            Err(ExecutorError::SlotsExhausted(_))
        ));
    }

    #[test]
    fn explicit_forwards_replace_default() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let forward = PortForward {
            internal_port: 80,
            protocol: Protocol::Tcp,
            external_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
        };
        let spec = match spec("web", Path::new("/images/os.tar.zst")).with_port_forwards(vec![forward]) {
            Ok(s) => s,
            Err(e) => panic!("bad forwards: {e}"),
        };
        assert_eq!(layout(&toolkit, &spec, 1).forwards, vec![forward]);
    }

    #[test]
    fn network_plan_uses_host_interface_and_netns_handle() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));
        let layout = layout(&toolkit, &spec, 2);

        let plan = toolkit.plan(SubsystemTag::Network, &spec, &layout);
        assert_eq!(plan.launch.program, PathBuf::from("/opt/drafter/bin/drafter-nat"));
        assert_eq!(plan.launch.flag_value("--host-interface"), Some("eth0"));
        assert!(format!("{:?}", plan.check).contains("/var/run/netns/ark2"));
    }

    #[test]
    fn snapshotter_plan_writes_every_package_artifact() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));
        let layout = layout(&toolkit, &spec, 0);

        let plan = toolkit.plan(SubsystemTag::Snapshotter, &spec, &layout);
        assert_eq!(plan.launch.flag_value("--netns"), Some("ark0"));
        assert_eq!(plan.launch.flag_value("--cpu-template"), Some("T2A"));
        assert_eq!(plan.launch.flag_value("--memory-size"), Some("2048"));

        let devices: serde_json::Value = match plan.launch.flag_value("--devices").map(serde_json::from_str) {
            Some(Ok(v)) => v,
            other => panic!("devices not json: {other:?}"),
        };
        let names: Vec<_> = devices
            .as_array()
            .map(|a| a.iter().filter_map(|d| d["name"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(names, ["state", "memory", "kernel", "disk", "config"]);
        assert_eq!(devices[2]["input"], "/srv/ark/redis/blueprint/vmlinux");
        assert_eq!(devices[1]["output"], "/srv/ark/redis/package/memory.bin");
        assert_eq!(plan.policy, toolkit.config().snapshot);
    }

    #[test]
    fn resume_plan_listens_on_slot_address() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));
        let layout = layout(&toolkit, &spec, 1);

        let plan = toolkit.plan(SubsystemTag::Resume, &spec, &layout);
        assert_eq!(plan.launch.flag_value("--netns"), Some("ark1"));
        assert_eq!(plan.launch.flag_value("--raddr"), Some(""));
        assert_eq!(plan.launch.flag_value("--laddr"), Some("127.0.0.1:1338"));

        let devices: serde_json::Value = match plan.launch.flag_value("--devices").map(serde_json::from_str) {
            Some(Ok(v)) => v,
            other => panic!("devices not json: {other:?}"),
        };
        assert_eq!(devices[0]["base"], "/srv/ark/redis/package/state.bin");
        assert_eq!(devices[0]["overlay"], "/srv/ark/redis/instance-0/overlay/state.bin");
    }

    #[test]
    fn forwarder_plan_encodes_port_forwards() {
        let toolkit = toolkit(Path::new("/srv/ark"));
        let spec = spec("redis", Path::new("/images/os.tar.zst"));
        let layout = layout(&toolkit, &spec, 0);

        let plan = toolkit.plan(SubsystemTag::Forwarder, &spec, &layout);
        let forwards: serde_json::Value = match plan.launch.flag_value("--port-forwards").map(serde_json::from_str) {
            Some(Ok(v)) => v,
            other => panic!("forwards not json: {other:?}"),
        };
        assert_eq!(
            forwards,
            json!([{ "netns": "ark0", "internalPort": "6379", "protocol": "tcp", "externalAddr": "127.0.0.1:3333" }])
        );
    }

    #[tokio::test]
    async fn prepare_skips_extraction_for_blueprint_directory() {
        let state_dir = temp_dir("ark-state");
        let image = temp_dir("ark-image");
        if let Err(e) = tokio::fs::create_dir_all(&image).await {
            panic!("mkdir failed: {e}");
        }
        for file in ["vmlinux", "rootfs.ext4"] {
            if let Err(e) = tokio::fs::write(image.join(file), b"").await {
                panic!("write failed: {e}");
            }
        }

        // bin_dir points nowhere, so running the packager would fail.
        let toolkit = toolkit(&state_dir);
        let spec = spec("prepared", &image);
        let layout = match toolkit.prepare(&spec, 0).await {
            Ok(l) => l,
            Err(e) => panic!("prepare failed: {e}"),
        };

        assert_eq!(layout.kernel, image.join("vmlinux"));
        for dir in layout.directories() {
            assert!(dir.is_dir(), "{} not created", dir.display());
        }
        let _ = tokio::fs::remove_dir_all(&state_dir).await;
        let _ = tokio::fs::remove_dir_all(&image).await;
    }

    #[tokio::test]
    async fn missing_packager_fails_blueprint_extraction() {
        let state_dir = temp_dir("ark-state");
        let toolkit = toolkit(&state_dir);
        let spec = spec("archive", Path::new("/images/os.tar.zst"));

        let err = toolkit.prepare(&spec, 0).await;
        assert!(matches!(err, Err(ExecutorError::BlueprintFailed(_))), "got {err:?}");
        let _ = tokio::fs::remove_dir_all(&state_dir).await;
    }

    #[tokio::test]
    async fn failing_packager_reports_stderr() {
        let state_dir = temp_dir("ark-state");
        let bin_dir = temp_dir("ark-bin");
        if let Err(e) = tokio::fs::create_dir_all(&bin_dir).await {
            panic!("mkdir failed: {e}");
        }
        let script = bin_dir.join(PACKAGER);
        if let Err(e) = tokio::fs::write(&script, "#!/bin/sh\necho 'archive is corrupt' >&2\nexit 2\n").await {
            panic!("write failed: {e}");
        }
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await {
                panic!("chmod failed: {e}");
            }
        }

        let mut config = ToolkitConfig::new(state_dir.clone());
        config.bin_dir = Some(bin_dir.clone());
        config.blueprint_timeout = Duration::from_secs(10);
        let toolkit = DrafterToolkit::new(config);
        let spec = spec("corrupt", Path::new("/images/os.tar.zst"));

        match toolkit.prepare(&spec, 0).await {
            Err(ExecutorError::BlueprintFailed(msg)) => assert!(msg.contains("archive is corrupt"), "{msg}"),
            other => panic!("expected BlueprintFailed, got {other:?}"),
        }
        let _ = tokio::fs::remove_dir_all(&state_dir).await;
        let _ = tokio::fs::remove_dir_all(&bin_dir).await;
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }
}
