//! Gateway configuration from `ARK_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ark_executor::{OrchestratorConfig, ToolkitConfig};

use crate::error::GatewayError;

/// Everything the gateway binary needs to start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// How long a lifecycle request waits before answering `202 Accepted`.
    pub request_timeout: Duration,
    pub toolkit: ToolkitConfig,
    pub orchestrator: OrchestratorConfig,
}

impl GatewayConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`GatewayError::InvalidConfig`] naming the first variable
    /// that does not parse.
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`; unset variables use defaults.
    ///
    /// # Errors
    /// Returns [`GatewayError::InvalidConfig`] naming the first variable
    /// that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let env = Env(lookup);

        let mut toolkit = ToolkitConfig::new(env.parse("ARK_STATE_DIR")?.unwrap_or_else(|| PathBuf::from("out")));
        toolkit.bin_dir = env.parse("ARK_BIN_DIR")?;
        if let Some(iface) = env.string("ARK_HOST_INTERFACE")? {
            toolkit.host_interface = iface;
        }
        if let Some(prefix) = env.string("ARK_NETNS_PREFIX")? {
            toolkit.netns_prefix = prefix;
        }
        if let Some(dir) = env.parse("ARK_NETNS_DIR")? {
            toolkit.netns_dir = dir;
        }
        if let Some(template) = env.string("ARK_CPU_TEMPLATE")? {
            toolkit.cpu_template = template;
        }
        if let Some(raddr) = (env.0)("ARK_RESUME_REMOTE_ADDR") {
            toolkit.resume_remote_addr = raddr;
        }
        if let Some(port) = env.parse("ARK_RESUME_BASE_PORT")? {
            toolkit.resume_base_port = port;
        }
        if let Some(port) = env.parse("ARK_FORWARD_BASE_PORT")? {
            toolkit.forward_base_port = port;
        }
        if let Some(port) = env.parse("ARK_FORWARD_INTERNAL_PORT")? {
            toolkit.forward_internal_port = port;
        }
        if let Some(deadline) = env.secs("ARK_READINESS_TIMEOUT_SECS")? {
            toolkit.readiness.deadline = deadline;
        }
        if let Some(deadline) = env.secs("ARK_SNAPSHOT_TIMEOUT_SECS")? {
            toolkit.snapshot.deadline = deadline;
        }
        if let Some(timeout) = env.secs("ARK_BLUEPRINT_TIMEOUT_SECS")? {
            toolkit.blueprint_timeout = timeout;
        }

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig::new(
            env.secs("ARK_GRACE_PERIOD_SECS")?.unwrap_or(defaults.grace_period),
            env.parse("ARK_MAX_INSTANCES")?.unwrap_or(defaults.max_instances),
        );

        Ok(Self {
            listen_addr: env
                .parse("ARK_LISTEN_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080))),
            request_timeout: env.secs("ARK_REQUEST_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(900)),
            toolkit,
            orchestrator,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// A non-empty string value.
    fn string(&self, var: &'static str) -> Result<Option<String>, GatewayError> {
        match (self.0)(var) {
            Some(v) if v.trim().is_empty() => Err(GatewayError::InvalidConfig { var, reason: "empty value".to_owned() }),
            other => Ok(other),
        }
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, GatewayError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)?
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|e: T::Err| GatewayError::InvalidConfig { var, reason: format!("'{v}': {e}") })
            })
            .transpose()
    }

    /// Whole seconds; zero is rejected.
    fn secs(&self, var: &'static str) -> Result<Option<Duration>, GatewayError> {
        match self.parse::<u64>(var)? {
            Some(0) => Err(GatewayError::InvalidConfig { var, reason: "must be at least 1".to_owned() }),
            other => Ok(other.map(Duration::from_secs)),
        }
    }
}
