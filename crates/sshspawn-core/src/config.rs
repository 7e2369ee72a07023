//! Spawner configuration, loaded from RON.
//!
//! Every field has a default, so an empty `()` file is valid. Example:
//!
//! ```ron
//! (
//!     remote_hosts: ["login1.cluster", "login2.cluster"],
//!     ssh_keyfile: "/etc/sshspawn/keys/{username}",
//!     remote_port_command: "/usr/local/bin/sshspawn-getport",
//!     hub_api_url: Some("http://hub.internal:15001/hub/api"),
//!     extra_args: ["--config=~/.jupyter/jupyter_notebook_config.py"],
//!     poll_policy: (transport_failures_before_exit: 3),
//! )
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::ssh::{
    AcceptAnyHostKey, HostKeyVerifier, OpenSshExecutor, PinnedHostKeys, RusshExecutor,
    SshExecutor,
};

/// Which SSH client carries the round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// In-process russh client.
    #[default]
    Native,
    /// The `ssh_command` binary.
    Openssh,
}

/// How poll treats transport failures.
///
/// A probe that reached the host and got a non-zero exit is always death.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Consecutive unreachable probes before the process is presumed gone.
    /// `1` treats any transport failure as exit.
    pub transport_failures_before_exit: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { transport_failures_before_exit: 1 }
    }
}

/// Retry of a failed start, applied by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first. `0` disables retry.
    pub retries: u32,
    /// Delay before retry `n` is `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 0, backoff_ms: 1000 }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Candidate hosts for new sessions.
    pub remote_hosts: Vec<String>,
    pub ssh_port: u16,
    pub ssh_command: String,
    pub transport: Transport,
    /// Remote `PATH`. Empty leaves the remote default alone.
    pub path: String,
    pub remote_port_command: String,
    /// Replaces the hub API URL the control plane passes in.
    pub hub_api_url: Option<String>,
    /// Key file template; `{username}` is the remote identity.
    pub ssh_keyfile: String,
    /// Resource directory relative to the remote home.
    pub resource_path: String,
    /// Local directory certificates are staged into.
    pub staging_dir: Option<PathBuf>,
    pub remote_log: String,
    /// Trusted shell lines run before the launch.
    pub pre_launch: Vec<String>,
    pub bind_ip: String,
    /// Trusted arguments appended verbatim after the control plane's.
    pub extra_args: Vec<String>,
    pub ssh_timeout_secs: u64,
    pub poll_policy: PollPolicy,
    pub start_retry: RetryPolicy,
    /// Pinned SHA-256 host key fingerprints per host (native transport).
    /// Empty disables verification.
    pub known_hosts: HashMap<String, Vec<String>>,
    /// known_hosts file for the openssh transport. Unset disables verification.
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            remote_hosts: Vec::new(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_command: DEFAULT_SSH_COMMAND.into(),
            transport: Transport::default(),
            path: DEFAULT_REMOTE_PATH.into(),
            remote_port_command: DEFAULT_REMOTE_PORT_COMMAND.into(),
            hub_api_url: None,
            ssh_keyfile: DEFAULT_SSH_KEYFILE.into(),
            resource_path: DEFAULT_RESOURCE_PATH.into(),
            staging_dir: None,
            remote_log: DEFAULT_REMOTE_LOG.into(),
            pre_launch: Vec::new(),
            bind_ip: DEFAULT_BIND_IP.into(),
            extra_args: Vec::new(),
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT.as_secs(),
            poll_policy: PollPolicy::default(),
            start_retry: RetryPolicy::default(),
            known_hosts: HashMap::new(),
            known_hosts_file: None,
        }
    }
}

impl SpawnerConfig {
    /// Parse a RON document.
    pub fn from_ron(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: SpawnerConfig = ron::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&source, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(ConfigError::Invalid("remote_hosts contains an empty entry".into()));
        }
        if self.remote_port_command.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_port_command is empty".into()));
        }
        if self.ssh_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ssh_timeout_secs must be positive".into()));
        }
        if self.poll_policy.transport_failures_before_exit == 0 {
            return Err(ConfigError::Invalid(
                "poll_policy.transport_failures_before_exit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Host key policy for the native transport: pinned fingerprints, or
    /// accept-any when `known_hosts` is empty.
    pub fn host_key_verifier(&self) -> Arc<dyn HostKeyVerifier> {
        let pins = PinnedHostKeys::new(self.known_hosts.clone());
        if pins.is_empty() {
            Arc::new(AcceptAnyHostKey)
        } else {
            Arc::new(pins)
        }
    }

    /// Build the executor selected by `transport`.
    pub fn executor(&self) -> Arc<dyn SshExecutor> {
        match self.transport {
            Transport::Native => {
                let verifier = self.host_key_verifier();
                if verifier.is_unverified() {
                    tracing::warn!("host key verification disabled (no known_hosts pins)");
                }
                Arc::new(RusshExecutor::new(verifier).with_timeout(self.ssh_timeout()))
            }
            Transport::Openssh => {
                let exec = OpenSshExecutor::new(self.ssh_command.clone());
                match &self.known_hosts_file {
                    Some(path) => Arc::new(exec.with_known_hosts(path.clone())),
                    None => {
                        tracing::warn!("host key verification disabled (no known_hosts_file)");
                        Arc::new(exec)
                    }
                }
            }
        }
    }
}
