//! Executor that shells out to the system OpenSSH client.
//!
//! Useful where the deployment relies on `ssh_config` features (jump hosts,
//! certificates) that the native client does not read.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandOutput, Payload, SshExecutor, SshTarget};
use crate::error::ConnectionError;

/// Exit status OpenSSH reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

pub struct OpenSshExecutor {
    ssh_command: String,
    known_hosts: Option<PathBuf>,
}

impl OpenSshExecutor {
    pub fn new(ssh_command: impl Into<String>) -> Self {
        Self {
            ssh_command: ssh_command.into(),
            known_hosts: None,
        }
    }

    /// Verify host keys against this known_hosts file instead of skipping checks.
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Arguments passed to the client, excluding the program itself.
    pub fn args(&self, target: &SshTarget, payload: &Payload) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.key_path.display().to_string(),
            "-l".to_string(),
            target.identity.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
        ];
        match &self.known_hosts {
            Some(path) => {
                args.push("-o".into());
                args.push("StrictHostKeyChecking=yes".into());
                args.push("-o".into());
                args.push(format!("UserKnownHostsFile={}", path.display()));
            }
            None => {
                args.push("-o".into());
                args.push("StrictHostKeyChecking=no".into());
                args.push("-o".into());
                args.push("UserKnownHostsFile=/dev/null".into());
            }
        }
        args.push(target.host.clone());
        args.push("--".into());
        args.push(payload.command_line().to_string());
        args
    }
}

#[async_trait]
impl SshExecutor for OpenSshExecutor {
    async fn execute(
        &self,
        target: &SshTarget,
        payload: &Payload,
    ) -> Result<CommandOutput, ConnectionError> {
        let mut child = Command::new(&self.ssh_command)
            .args(self.args(target, payload))
            .stdin(if payload.stdin().is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectionError::Spawn(format!("{}: {}", self.ssh_command, e)))?;

        if let (Some(script), Some(mut stdin)) = (payload.stdin(), child.stdin.take()) {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| ConnectionError::Channel {
                    host: target.host.clone(),
                    reason: e.to_string(),
                })?;
            // stdin dropped here → EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ConnectionError::Spawn(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(SSH_CLIENT_FAILURE) => Err(ConnectionError::Connect {
                host: target.host.clone(),
                reason: stderr.trim().to_string(),
            }),
            code => Ok(CommandOutput {
                stdout,
                stderr,
                exit_status: code.and_then(|c| u32::try_from(c).ok()),
            }),
        }
    }
}
