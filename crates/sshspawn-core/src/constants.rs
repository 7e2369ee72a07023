//! Spawner configuration defaults.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port on the candidate hosts.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default OpenSSH client binary, used by the `openssh` transport.
pub const DEFAULT_SSH_COMMAND: &str = "/usr/bin/ssh";

/// Default remote `PATH` (should include the launched program and its interpreter).
pub const DEFAULT_REMOTE_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin";

/// Default remote command printing `<address> <port>`.
pub const DEFAULT_REMOTE_PORT_COMMAND: &str = "/usr/local/bin/sshspawn-getport";

/// Default key file template. `{username}` becomes the remote identity.
pub const DEFAULT_SSH_KEYFILE: &str = "~/.ssh/id_rsa";

/// Default resource directory, relative to the remote home directory.
pub const DEFAULT_RESOURCE_PATH: &str = ".sshspawn-resources";

/// Default remote log file, relative to the remote home directory.
pub const DEFAULT_REMOTE_LOG: &str = ".sshspawn.log";

/// Default address the launched process is told to bind.
pub const DEFAULT_BIND_IP: &str = "0.0.0.0";

/// Upper bound on a single SSH round-trip (connect + exec + drain).
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote command used to feed the launch script over stdin.
pub const SCRIPT_RUNNER: &str = "bash -s";

/// Signal sent by `stop`.
pub const SIGTERM: i32 = 15;

/// Null signal used by `poll` to probe for existence.
pub const SIGNAL_PROBE: i32 = 0;

/// Environment variable the launched process reads the hub API URL from.
pub const HUB_API_URL_ENV: &str = "JUPYTERHUB_API_URL";

/// Launch argument carrying the hub API URL.
pub const HUB_API_URL_ARG: &str = "--hub-api-url";

/// Environment variables pointing the launched process at staged TLS material.
pub const SSL_KEYFILE_ENV: &str = "JUPYTERHUB_SSL_KEYFILE";
pub const SSL_CLIENT_CA_ENV: &str = "JUPYTERHUB_SSL_CLIENT_CA";

/// Runtime directory variable cleared before launch.
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";
