//! sshspawn core
//!
//! Launches, supervises, and terminates one long-running process per user on
//! a remote host, using nothing but one-shot SSH round-trips. There is no
//! agent on the remote side: port negotiation, launch, liveness and
//! termination are each a single command over a fresh connection.

pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod manager;
pub mod negotiate;
pub mod placement;
pub mod script;
pub mod session;
pub mod spawner;
pub mod ssh;
pub mod staging;
pub mod store;

pub use config::{PollPolicy, RetryPolicy, SpawnerConfig, Transport};
pub use error::{ConfigError, ConnectionError, SpawnError, SpawnResult, StagingError};
pub use identity::RemoteIdentity;
pub use manager::{ManagerError, SessionManager};
pub use negotiate::Endpoint;
pub use placement::{FirstHost, HostSelector, UniformRandom};
pub use session::{PersistedState, Phase, Session};
pub use spawner::{LaunchRequest, PollStatus, Spawner};
pub use ssh::{CommandOutput, Payload, SshExecutor, SshTarget};
pub use staging::{CertPaths, StagedCerts};
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError};
