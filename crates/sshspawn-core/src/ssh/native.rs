//! In-process SSH client built on russh.
//!
//! Key file authentication only; the key is loaded from disk per call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config};
use russh::keys::{load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};

use super::{AcceptAnyHostKey, CommandOutput, HostKeyVerifier, Payload, SshExecutor, SshTarget};
use crate::constants::DEFAULT_SSH_TIMEOUT;
use crate::error::ConnectionError;

/// SSH extended data stream number for stderr.
const STDERR_EXT: u32 = 1;

/// Client handler for russh - delegates server key verification
struct ClientHandler {
    host: String,
    verifier: Arc<dyn HostKeyVerifier>,
    rejected: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accepted = self.verifier.verify(&self.host, &fingerprint);
        if !accepted {
            if let Ok(mut slot) = self.rejected.lock() {
                *slot = Some(fingerprint);
            }
        }
        Ok(accepted)
    }
}

/// Native executor: one russh connection per call.
pub struct RusshExecutor {
    verifier: Arc<dyn HostKeyVerifier>,
    inactivity_timeout: Duration,
}

impl Default for RusshExecutor {
    fn default() -> Self {
        Self::new(Arc::new(AcceptAnyHostKey))
    }
}

impl RusshExecutor {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            inactivity_timeout: DEFAULT_SSH_TIMEOUT,
        }
    }

    /// Idle limit on an open connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    fn client_config(&self) -> Config {
        Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..<_>::default()
        }
    }
}

#[async_trait]
impl SshExecutor for RusshExecutor {
    async fn execute(
        &self,
        target: &SshTarget,
        payload: &Payload,
    ) -> Result<CommandOutput, ConnectionError> {
        let host = target.host.clone();

        let key = load_secret_key(&target.key_path, None).map_err(|e| ConnectionError::Key {
            path: target.key_path.clone(),
            reason: e.to_string(),
        })?;

        let config = self.client_config();

        let rejected = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: host.clone(),
            verifier: Arc::clone(&self.verifier),
            rejected: Arc::clone(&rejected),
        };

        let addr = (target.host.as_str(), target.port);
        let mut session = match client::connect(Arc::new(config), addr, handler).await {
            Ok(session) => session,
            Err(e) => {
                let fingerprint = rejected.lock().ok().and_then(|mut slot| slot.take());
                return Err(match fingerprint {
                    Some(fingerprint) => ConnectionError::HostKeyRejected { host, fingerprint },
                    None => ConnectionError::Connect { host, reason: e.to_string() },
                });
            }
        };

        tracing::debug!(host = %target.host, port = target.port, "connected, authenticating");

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let auth = session
            .authenticate_publickey(
                target.identity.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| ConnectionError::Auth {
                host: host.clone(),
                user: target.identity.to_string(),
                reason: e.to_string(),
            })?;

        if !auth.success() {
            return Err(ConnectionError::Auth {
                host,
                user: target.identity.to_string(),
                reason: "key rejected by server".into(),
            });
        }

        let channel_err = |e: russh::Error| ConnectionError::Channel {
            host: target.host.clone(),
            reason: e.to_string(),
        };

        let mut channel = session.channel_open_session().await.map_err(channel_err)?;
        channel
            .exec(true, payload.command_line())
            .await
            .map_err(channel_err)?;
        if let Some(script) = payload.stdin() {
            channel.data(script.as_bytes()).await.map_err(channel_err)?;
        }
        channel.eof().await.map_err(channel_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_EXT => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "done", "en")
            .await
        {
            tracing::debug!("disconnect from {} failed: {}", target.host, e);
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }
}
