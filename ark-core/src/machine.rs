//! Validated VM specifications.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::VmName;

/// Smallest memory size a guest is allowed to boot with.
pub const MIN_MEMORY_MIB: u64 = 128;

/// Largest vCPU count accepted in a request.
pub const MAX_CPUS: u32 = 64;

/// Transport protocol of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Exposes a guest port on a host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortForward {
    /// Port inside the VM's network namespace.
    pub internal_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Host address the forwarder listens on.
    pub external_addr: SocketAddr,
}

/// A fully validated request to create a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmSpec {
    /// Unique instance name.
    pub name: VmName,
    /// Guest memory in mebibytes.
    pub memory_mib: u32,
    /// Number of virtual CPUs.
    pub cpus: u32,
    /// Requested disk size in mebibytes.
    ///
    /// Validated and recorded only. The toolkit sizes the disk from the
    /// blueprint's `rootfs.ext4` and none of its binaries takes a size flag.
    pub disk_size_mib: u64,
    /// OCI archive or extracted blueprint directory to build the VM from.
    pub image_path: PathBuf,
    /// Port forwards. Empty means the toolkit's default forward.
    pub port_forwards: Vec<PortForward>,
}

impl VmSpec {
    /// Parses and validates the raw request fields of a `create` command.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] for a bad name,
    /// [`CoreError::InvalidSize`] for unparseable sizes, and
    /// [`CoreError::InvalidField`] for out-of-range values.
    pub fn parse(
        name: &str,
        memory: &str,
        cpus: u32,
        disk_size: &str,
        image_path: &str,
    ) -> Result<Self, CoreError> {
        let name = VmName::new(name)?;

        let memory_mib = parse_size_mib(memory)?;
        if memory_mib < MIN_MEMORY_MIB {
            return Err(CoreError::InvalidField {
                field: "memory".to_owned(),
                reason: format!("must be at least {MIN_MEMORY_MIB} MiB, got {memory_mib} MiB"),
            });
        }
        let memory_mib = u32::try_from(memory_mib).map_err(|_| CoreError::InvalidField {
            field: "memory".to_owned(),
            reason: format!("{memory_mib} MiB is too large"),
        })?;

        if cpus == 0 || cpus > MAX_CPUS {
            return Err(CoreError::InvalidField {
                field: "cpus".to_owned(),
                reason: format!("must be between 1 and {MAX_CPUS}, got {cpus}"),
            });
        }

        let disk_size_mib = parse_size_mib(disk_size)?;

        if image_path.trim().is_empty() {
            return Err(CoreError::InvalidField {
                field: "image_path".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        Ok(Self {
            name,
            memory_mib,
            cpus,
            disk_size_mib,
            image_path: PathBuf::from(image_path),
            port_forwards: Vec::new(),
        })
    }

    /// Attaches explicit port forwards.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] if a port is zero or two
    /// forwards share an external address and protocol.
    pub fn with_port_forwards(mut self, forwards: Vec<PortForward>) -> Result<Self, CoreError> {
        let mut seen = BTreeSet::new();
        for fwd in &forwards {
            if fwd.internal_port == 0 || fwd.external_addr.port() == 0 {
                return Err(CoreError::InvalidField {
                    field: "port_forwards".to_owned(),
                    reason: "ports must be non-zero".to_owned(),
                });
            }
            if !seen.insert((fwd.external_addr, fwd.protocol.to_string())) {
                return Err(CoreError::InvalidField {
                    field: "port_forwards".to_owned(),
                    reason: format!("duplicate external address {} ({})", fwd.external_addr, fwd.protocol),
                });
            }
        }
        self.port_forwards = forwards;
        Ok(self)
    }
}

/// Parses a size string into mebibytes.
///
/// A bare number is taken as MiB (`"2048"`). Suffixes `K`, `M`, `G` and
/// `T` are binary multiples and may be followed by `B` or `iB`, in any case
/// (`"2G"`, `"512MiB"`, `"1tb"`). Kibibyte values are rounded up to the next
/// whole MiB.
///
/// # Errors
/// Returns [`CoreError::InvalidSize`] for empty, zero, malformed or
/// overflowing input.
pub fn parse_size_mib(input: &str) -> Result<u64, CoreError> {
    let invalid = |reason: &str| CoreError::InvalidSize {
        value: input.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);
    if digits.is_empty() {
        return Err(invalid("expected a number"));
    }
    let value: u64 = digits.parse().map_err(|_| invalid("number is too large"))?;

    let unit = unit.trim().to_ascii_lowercase();
    if unit == "b" {
        return Err(invalid("byte sizes are not supported; use K, M, G or T"));
    }
    let unit = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b'))
        .unwrap_or(&unit);

    let mib = match unit {
        "" | "m" => Some(value),
        "k" => Some(value.div_ceil(1024)),
        "g" => value.checked_mul(1024),
        "t" => value.checked_mul(1024 * 1024),
        _ => return Err(invalid("unknown unit; expected K, M, G or T")),
    }
    .ok_or_else(|| invalid("size overflows"))?;

    if mib == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(mib)
}
