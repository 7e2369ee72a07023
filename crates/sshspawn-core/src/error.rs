//! Error types for the spawner.

use std::path::PathBuf;

use thiserror::Error;

/// Could not reach the remote side at all.
///
/// Distinct from a remote command that ran and failed: callers treat this as
/// "could not reach remote", never as "process exited".
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },
    #[error("authentication as {user} on {host} failed: {reason}")]
    Auth { host: String, user: String, reason: String },
    #[error("cannot load key {path}: {reason}")]
    Key { path: PathBuf, reason: String },
    #[error("host key for {host} rejected: {fingerprint}")]
    HostKeyRejected { host: String, fingerprint: String },
    #[error("channel failed on {host}: {reason}")]
    Channel { host: String, reason: String },
    #[error("ssh round-trip to {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
    #[error("cannot run ssh client: {0}")]
    Spawn(String),
}

/// Failure of one spawner operation. Scoped to a single session.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Reached the remote, command exited non-zero or printed nothing.
    #[error("remote command failed (exit {exit_status:?}): {stderr}")]
    CommandFailure { exit_status: Option<u32>, stderr: String },

    /// Output did not have the expected shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("no candidate hosts configured")]
    NoCandidateHosts,

    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvironment(String),

    /// Start called while a process is already on record.
    #[error("session already running (pid {pid} at {address})")]
    AlreadyRunning { pid: u32, address: String },
}

impl SpawnError {
    /// True for transport-level failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, SpawnError::Connection(_))
    }
}

/// Local move/copy of TLS material failed.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("cannot create {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("cannot move {from} to {to}: {source}")]
    Move { from: PathBuf, to: PathBuf, source: std::io::Error },
    #[error("cannot copy {from} to {to}: {source}")]
    Copy { from: PathBuf, to: PathBuf, source: std::io::Error },
    #[error("not a file path: {0}")]
    NoFileName(PathBuf),
    #[error("certificates supplied but no staging_dir configured")]
    NotConfigured,
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("RON syntax error in {path}: {source}")]
    Parse { path: PathBuf, source: ron::error::SpannedError },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type SpawnResult<T> = Result<T, SpawnError>;
