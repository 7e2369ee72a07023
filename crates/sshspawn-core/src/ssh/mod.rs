//! One-shot SSH execution.
//!
//! Every call opens a fresh authenticated connection, runs exactly one
//! command (optionally feeding a script on stdin), collects output and exit
//! status, and disconnects. Nothing is pooled or reused between calls.

mod hostkey;
#[cfg(any(test, feature = "test-mock"))]
mod mock;
mod openssh;
mod native;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::identity::RemoteIdentity;

pub use hostkey::{AcceptAnyHostKey, HostKeyVerifier, PinnedHostKeys};
#[cfg(any(test, feature = "test-mock"))]
pub use mock::{MockExecutor, MockReply, RecordedCall};
pub use native::RusshExecutor;
pub use openssh::OpenSshExecutor;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub identity: RemoteIdentity,
    pub key_path: PathBuf,
}

/// What to run on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A single command line.
    Command(String),
    /// `runner` is executed and `script` is written to its stdin, then EOF.
    Script { runner: String, script: String },
}

impl Payload {
    /// The command line sent in the exec request.
    pub fn command_line(&self) -> &str {
        match self {
            Payload::Command(cmd) => cmd,
            Payload::Script { runner, .. } => runner,
        }
    }

    pub fn stdin(&self) -> Option<&str> {
        match self {
            Payload::Command(_) => None,
            Payload::Script { script, .. } => Some(script),
        }
    }
}

/// Result of a remote command that ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without reporting a status.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Runs one payload over one short-lived SSH connection.
#[async_trait]
pub trait SshExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &SshTarget,
        payload: &Payload,
    ) -> Result<CommandOutput, ConnectionError>;
}

/// Run `payload` with an upper bound on the whole round-trip.
///
/// An elapsed timeout is a [`ConnectionError::Timeout`], never a command result.
#[tracing::instrument(
    skip(executor, target, payload),
    name = "ssh.exec",
    fields(host = %target.host, user = %target.identity)
)]
pub async fn execute_with_timeout(
    executor: &dyn SshExecutor,
    target: &SshTarget,
    payload: &Payload,
    timeout: Duration,
) -> Result<CommandOutput, ConnectionError> {
    match tokio::time::timeout(timeout, executor.execute(target, payload)).await {
        Ok(Ok(output)) => {
            tracing::debug!(
                command = payload.command_line(),
                exit_status = ?output.exit_status,
                stdout_len = output.stdout.len(),
                stderr = %output.stderr.trim(),
                "remote command finished"
            );
            Ok(output)
        }
        Ok(Err(e)) => {
            tracing::warn!("ssh round-trip failed: {}", e);
            Err(e)
        }
        Err(_) => {
            tracing::warn!(secs = timeout.as_secs(), "ssh round-trip timed out");
            Err(ConnectionError::Timeout {
                host: target.host.clone(),
                secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    fn target() -> SshTarget {
        SshTarget {
            host: "h1".into(),
            port: 22,
            identity: identity::resolve("amy"),
            key_path: PathBuf::from("/keys/id"),
        }
    }

    /// Executor that never answers.
    struct Stalled;

    #[async_trait]
    impl SshExecutor for Stalled {
        async fn execute(
            &self,
            _target: &SshTarget,
            _payload: &Payload,
        ) -> Result<CommandOutput, ConnectionError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_connection_error() {
        let err = execute_with_timeout(
            &Stalled,
            &target(),
            &Payload::Command("true".into()),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { secs: 5, .. }));
    }

    #[tokio::test]
    async fn test_passes_through_output() {
        let mock = MockExecutor::new();
        mock.push(MockReply::output("out", "", 3));
        let out = execute_with_timeout(
            &mock,
            &target(),
            &Payload::Command("false".into()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_status, Some(3));
        assert!(!out.success());
    }

    #[test]
    fn test_payload_accessors() {
        let p = Payload::Script { runner: "bash -s".into(), script: "echo 1".into() };
        assert_eq!(p.command_line(), "bash -s");
        assert_eq!(p.stdin(), Some("echo 1"));
        assert_eq!(Payload::Command("ls".into()).stdin(), None);
    }
}
