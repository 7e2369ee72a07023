//! Lifecycle of one user's remote process.
//!
//! ```text
//!   Idle ──start──▶ Starting ──pid──▶ Running ──stop──▶ Stopping ──▶ Idle
//!                       │                 │
//!                       └──failure──▶ Idle └──poll: gone──▶ Idle
//! ```
//!
//! Start drives host selection → port negotiation → script build → launch →
//! pid capture. Poll and stop skip selection and negotiation and talk to the
//! recorded address directly. The spawner is the only writer of its
//! [`Session`]; callers serialize operations on one spawner.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SpawnerConfig;
use crate::constants::{
    HUB_API_URL_ARG, HUB_API_URL_ENV, SCRIPT_RUNNER, SIGNAL_PROBE, SIGTERM, SSL_CLIENT_CA_ENV,
    SSL_KEYFILE_ENV,
};
use crate::error::{ConnectionError, SpawnError, SpawnResult, StagingError};
use crate::identity;
use crate::negotiate::{negotiate, Endpoint};
use crate::placement::HostSelector;
use crate::script::{parse_pid, shell_quote, LaunchScript};
use crate::session::{PersistedState, Phase, Session};
use crate::ssh::{execute_with_timeout, CommandOutput, Payload, SshExecutor, SshTarget};
use crate::staging::{self, CertPaths, StagedCerts};

/// What the control plane supplies for a launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Base environment for the remote process.
    pub environment: BTreeMap<String, String>,
    /// Program and arguments, unquoted.
    pub command: Vec<String>,
    /// Hub API URL the control plane put into `command`, if any.
    pub hub_api_url: Option<String>,
    /// TLS material to stage for the process.
    pub certs: Option<CertPaths>,
}

/// Outcome of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Probe succeeded.
    Running,
    /// Probe could not reach the host; below the policy threshold so the
    /// process is still presumed alive.
    Unreachable { consecutive: u32 },
    /// Process presumed gone; session cleared.
    Exited,
    /// Nothing on record; no network call was made.
    NotRunning,
}

impl PollStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, PollStatus::Running | PollStatus::Unreachable { .. })
    }

    /// `None` while alive. The signal probe cannot observe the real exit
    /// status, so a gone process reports `0`.
    pub fn exit_code(&self) -> Option<i32> {
        if self.is_alive() { None } else { Some(0) }
    }
}

pub struct Spawner {
    config: Arc<SpawnerConfig>,
    executor: Arc<dyn SshExecutor>,
    selector: Arc<dyn HostSelector>,
    session: Session,
    phase: Phase,
    transport_failures: u32,
}

impl Spawner {
    pub fn new(
        logical_user: impl Into<String>,
        config: Arc<SpawnerConfig>,
        executor: Arc<dyn SshExecutor>,
        selector: Arc<dyn HostSelector>,
    ) -> Self {
        let session = Session::new(logical_user, config.resource_path.clone());
        Self {
            config,
            executor,
            selector,
            session,
            phase: Phase::Idle,
            transport_failures: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(user = %self.session.logical_user(), from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }

    /// Stage certificates, then launch the process and return where it
    /// listens.
    pub async fn start(&mut self, request: &LaunchRequest) -> SpawnResult<Endpoint> {
        self.ensure_idle()?;
        let staged = self.stage_certs(request).await?;
        self.start_staged(request, staged.as_ref()).await
    }

    /// Refuse to start over a running process.
    pub fn ensure_idle(&self) -> SpawnResult<()> {
        if self.session.is_running() {
            return Err(SpawnError::AlreadyRunning {
                pid: self.session.pid(),
                address: self.session.remote_address().unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    /// Stage the request's certificates, if any. Staging moves the key, so a
    /// repeated start must reuse the result rather than stage again.
    pub async fn stage_certs(&self, request: &LaunchRequest) -> SpawnResult<Option<StagedCerts>> {
        let Some(certs) = &request.certs else {
            return Ok(None);
        };
        let dest = self
            .config
            .staging_dir
            .as_ref()
            .ok_or(StagingError::NotConfigured)?
            .join(self.session.remote_identity().as_str());
        Ok(Some(staging::stage(certs, &dest, self.session.resource_path()).await?))
    }

    /// Launch with certificates already staged.
    ///
    /// On any failure the session is restored to its value before the call
    /// and the phase returns to `Idle`.
    #[tracing::instrument(skip_all, name = "spawner.start", fields(user = %self.session.logical_user()))]
    pub async fn start_staged(
        &mut self,
        request: &LaunchRequest,
        staged: Option<&StagedCerts>,
    ) -> SpawnResult<Endpoint> {
        self.ensure_idle()?;

        let before = self.session.clone();
        self.set_phase(Phase::Starting);

        match self.launch(request, staged).await {
            Ok(endpoint) => {
                self.transport_failures = 0;
                self.set_phase(Phase::Running);
                tracing::info!(
                    address = %endpoint.address,
                    port = endpoint.port,
                    pid = self.session.pid(),
                    "started remote process"
                );
                Ok(endpoint)
            }
            Err(e) => {
                tracing::error!("no server produced: {}", e);
                self.session = before;
                self.set_phase(Phase::Idle);
                Err(e)
            }
        }
    }

    async fn launch(
        &mut self,
        request: &LaunchRequest,
        staged: Option<&StagedCerts>,
    ) -> SpawnResult<Endpoint> {
        let host = self
            .selector
            .choose(&self.config.remote_hosts)
            .ok_or(SpawnError::NoCandidateHosts)?;
        self.session.set_remote_host(host.clone());

        let endpoint = negotiate(
            self.executor.as_ref(),
            &self.target(&host),
            &self.config.remote_port_command,
            self.config.ssh_timeout(),
        )
        .await?;
        if endpoint.port == 0 || is_zero_address(&endpoint.address) {
            return Err(SpawnError::Protocol(format!(
                "negotiation returned unusable endpoint {}:{}",
                endpoint.address, endpoint.port
            )));
        }
        self.session.set_remote_address(endpoint.address.clone());
        self.session.set_remote_port(endpoint.port);

        let command = self.build_command(request, endpoint.port);
        tracing::info!(command = %command, "remote command");

        let script = LaunchScript::new(command, self.config.remote_log.clone())
            .with_environment(self.build_environment(request, staged))
            .with_pre_launch(self.config.pre_launch.clone())
            .render()?;
        tracing::trace!(script = %script, "launch script");

        // The launch runs against the negotiated address, not the selected host.
        let output = execute_with_timeout(
            self.executor.as_ref(),
            &self.target(&endpoint.address),
            &Payload::Script {
                runner: SCRIPT_RUNNER.to_string(),
                script,
            },
            self.config.ssh_timeout(),
        )
        .await?;
        tracing::info!(exit_status = ?output.exit_status, "launch script finished");

        let pid = parse_pid(&output)?;
        self.session.set_pid(pid);
        Ok(endpoint)
    }

    /// Probe the recorded process with the null signal.
    #[tracing::instrument(skip_all, name = "spawner.poll", fields(user = %self.session.logical_user(), pid = self.session.pid()))]
    pub async fn poll(&mut self) -> PollStatus {
        if !self.session.is_running() {
            self.session.clear();
            self.set_phase(Phase::Idle);
            return PollStatus::NotRunning;
        }

        match self.signal(SIGNAL_PROBE).await {
            Ok(output) if output.success() => {
                self.transport_failures = 0;
                PollStatus::Running
            }
            Ok(output) => {
                tracing::info!(
                    exit_status = ?output.exit_status,
                    stderr = %output.stderr.trim(),
                    "process gone"
                );
                self.mark_exited();
                PollStatus::Exited
            }
            Err(e) => {
                self.transport_failures += 1;
                let limit = self.config.poll_policy.transport_failures_before_exit;
                if self.transport_failures >= limit {
                    tracing::warn!(
                        failures = self.transport_failures,
                        "probe unreachable, presuming process exited: {}",
                        e
                    );
                    self.mark_exited();
                    PollStatus::Exited
                } else {
                    tracing::warn!(
                        failures = self.transport_failures,
                        limit,
                        "probe unreachable, still presumed running: {}",
                        e
                    );
                    PollStatus::Unreachable {
                        consecutive: self.transport_failures,
                    }
                }
            }
        }
    }

    fn mark_exited(&mut self) {
        self.session.clear();
        self.transport_failures = 0;
        self.set_phase(Phase::Idle);
    }

    /// Send SIGTERM and clear the session whatever the outcome.
    #[tracing::instrument(skip_all, name = "spawner.stop", fields(user = %self.session.logical_user(), pid = self.session.pid()))]
    pub async fn stop(&mut self) {
        if self.session.is_running() {
            self.set_phase(Phase::Stopping);
            match self.signal(SIGTERM).await {
                Ok(output) if output.success() => tracing::info!("sent SIGTERM"),
                Ok(output) => tracing::info!(
                    exit_status = ?output.exit_status,
                    stderr = %output.stderr.trim(),
                    "SIGTERM not delivered, process likely gone"
                ),
                Err(e) => tracing::warn!("could not reach remote to stop: {}", e),
            }
        }
        self.mark_exited();
    }

    async fn signal(&self, signal: i32) -> Result<CommandOutput, ConnectionError> {
        let address = self.session.remote_address().unwrap_or_default();
        let command = format!("kill -s {} {} < /dev/null", signal, self.session.pid());
        execute_with_timeout(
            self.executor.as_ref(),
            &self.target(address),
            &Payload::Command(command),
            self.config.ssh_timeout(),
        )
        .await
    }

    pub fn get_state(&self) -> PersistedState {
        self.session.persisted()
    }

    pub fn load_state(&mut self, state: &PersistedState) {
        self.session.load(state);
        if self.session.is_running() {
            self.set_phase(Phase::Running);
        }
    }

    pub fn clear_state(&mut self) {
        self.mark_exited();
    }

    fn target(&self, host: &str) -> SshTarget {
        let identity = self.session.remote_identity().clone();
        SshTarget {
            host: host.to_string(),
            port: self.config.ssh_port,
            key_path: identity::key_path(&self.config.ssh_keyfile, &identity),
            identity,
        }
    }

    /// Control-plane arguments (quoted, hub URL rewritten), then trusted
    /// extra arguments verbatim, then bind address and port.
    fn build_command(&self, request: &LaunchRequest, port: u16) -> String {
        let rewrite = match (&self.config.hub_api_url, &request.hub_api_url) {
            (Some(new), Some(old)) => Some((
                format!("{}={}", HUB_API_URL_ARG, old),
                format!("{}={}", HUB_API_URL_ARG, new),
            )),
            _ => None,
        };

        let mut parts: Vec<String> = request
            .command
            .iter()
            .map(|arg| match &rewrite {
                Some((old, new)) if arg == old => shell_quote(new),
                _ => shell_quote(arg),
            })
            .collect();
        parts.extend(self.config.extra_args.iter().cloned());
        parts.push(format!("--ip={}", shell_quote(&self.config.bind_ip)));
        parts.push(format!("--port={}", port));
        parts.join(" ")
    }

    fn build_environment(
        &self,
        request: &LaunchRequest,
        staged: Option<&StagedCerts>,
    ) -> BTreeMap<String, String> {
        let mut env = request.environment.clone();
        if let Some(url) = &self.config.hub_api_url {
            env.insert(HUB_API_URL_ENV.to_string(), url.clone());
        }
        if !self.config.path.is_empty() {
            env.insert("PATH".to_string(), self.config.path.clone());
        }
        if let Some(staged) = staged {
            env.insert(SSL_KEYFILE_ENV.to_string(), staged.keyfile.clone());
            env.insert(SSL_CLIENT_CA_ENV.to_string(), staged.cafile.clone());
        }
        if let Some(traceparent) = sshspawn_telemetry::current_traceparent() {
            env.insert("TRACEPARENT".to_string(), traceparent);
        }
        env
    }
}

fn is_zero_address(address: &str) -> bool {
    address.is_empty() || address == "0" || address == "0.0.0.0" || address == "::"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::FirstHost;
    use crate::ssh::{MockExecutor, MockReply};

    fn config() -> SpawnerConfig {
        SpawnerConfig {
            remote_hosts: vec!["h1".into(), "h2".into()],
            ssh_keyfile: "/keys/{username}".into(),
            ..Default::default()
        }
    }

    fn spawner_with(config: SpawnerConfig, mock: Arc<MockExecutor>) -> Spawner {
        Spawner::new("amy", Arc::new(config), mock, Arc::new(FirstHost))
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            environment: BTreeMap::from([("API_TOKEN".to_string(), "tok".to_string())]),
            command: vec![
                "jupyterhub-singleuser".into(),
                "--hub-api-url=http://127.0.0.1:8081/hub/api".into(),
            ],
            hub_api_url: Some("http://127.0.0.1:8081/hub/api".into()),
            certs: None,
        }
    }

    fn running(mock: &Arc<MockExecutor>) -> Spawner {
        let mut sp = spawner_with(config(), Arc::clone(mock));
        sp.load_state(&PersistedState {
            pid: Some(4821),
            remote_address: Some("10.0.0.5".into()),
        });
        sp
    }

    #[tokio::test]
    async fn test_start_happy_path() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("10.0.0.5 37281\n", "", 0));
        mock.push(MockReply::output("4821\n", "", 0));
        let mut sp = spawner_with(config(), Arc::clone(&mock));

        let ep = sp.start(&request()).await.unwrap();
        assert_eq!(ep, Endpoint { address: "10.0.0.5".into(), port: 37281 });
        assert_eq!(sp.phase(), Phase::Running);
        assert_eq!(sp.session().pid(), 4821);
        assert_eq!(sp.session().remote_port(), 37281);
        assert_eq!(sp.session().remote_host(), Some("h1"));

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].target.host, "h1");
        assert_eq!(calls[0].payload, Payload::Command(config().remote_port_command));
        assert_eq!(calls[1].target.host, "10.0.0.5");
        let id = identity::resolve("amy");
        assert_eq!(calls[1].target.identity, id);
        assert_eq!(calls[1].target.key_path, std::path::PathBuf::from(format!("/keys/{}", id)));
        let script = calls[1].payload.stdin().unwrap();
        assert!(script.contains("export API_TOKEN='tok'\n"));
        assert!(script.contains("--ip=0.0.0.0 --port=37281 < /dev/null"));
        assert!(script.ends_with("echo $!\n"));
    }

    #[tokio::test]
    async fn test_start_negotiation_failure_leaves_idle() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "bind: address in use", 1));
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        let before = sp.session().clone();

        let err = sp.start(&request()).await.unwrap_err();
        assert!(matches!(err, SpawnError::CommandFailure { .. }));
        assert_eq!(sp.phase(), Phase::Idle);
        assert_eq!(sp.session(), &before);
        assert!(sp.get_state().is_empty());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_start_zero_port_is_failure() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("10.0.0.5 0", "", 0));
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        assert!(matches!(sp.start(&request()).await, Err(SpawnError::Protocol(_))));
        assert!(sp.get_state().is_empty());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_start_bad_pid_is_failure() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("10.0.0.5 37281", "", 0));
        mock.push(MockReply::output("bash: jupyterhub-singleuser: not found\n", "", 0));
        let mut sp = spawner_with(config(), Arc::clone(&mock));

        assert!(matches!(sp.start(&request()).await, Err(SpawnError::Protocol(_))));
        assert_eq!(sp.phase(), Phase::Idle);
        assert_eq!(sp.session().pid(), 0);
        assert!(sp.get_state().is_empty());
    }

    #[tokio::test]
    async fn test_start_unreachable_is_connection_error() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("connection refused"));
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        let err = sp.start(&request()).await.unwrap_err();
        assert!(err.is_connection());
        assert!(sp.get_state().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_hosts() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = spawner_with(SpawnerConfig::default(), Arc::clone(&mock));
        assert!(matches!(sp.start(&request()).await, Err(SpawnError::NoCandidateHosts)));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_start_refuses_when_running() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = running(&mock);
        assert!(matches!(
            sp.start(&request()).await,
            Err(SpawnError::AlreadyRunning { pid: 4821, .. })
        ));
        assert_eq!(mock.call_count(), 0);
        assert_eq!(sp.session().pid(), 4821);
    }

    #[tokio::test]
    async fn test_start_certs_without_staging_dir() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        let mut req = request();
        req.certs = Some(CertPaths {
            keyfile: "/tmp/k".into(),
            cafile: "/tmp/c".into(),
        });
        assert!(matches!(
            sp.start(&req).await,
            Err(SpawnError::Staging(StagingError::NotConfigured))
        ));
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_build_command_rewrites_hub_url() {
        let mock = Arc::new(MockExecutor::new());
        let mut cfg = config();
        cfg.hub_api_url = Some("http://hub.internal:15001/hub/api".into());
        cfg.extra_args = vec!["--config=~/.jupyter/jupyter_notebook_config.py".into()];
        let sp = spawner_with(cfg, mock);

        let cmd = sp.build_command(&request(), 4000);
        assert_eq!(
            cmd,
            "jupyterhub-singleuser --hub-api-url=http://hub.internal:15001/hub/api \
             --config=~/.jupyter/jupyter_notebook_config.py --ip=0.0.0.0 --port=4000"
        );
    }

    #[test]
    fn test_build_command_quotes_control_plane_args() {
        let mock = Arc::new(MockExecutor::new());
        let sp = spawner_with(config(), mock);
        let req = LaunchRequest {
            command: vec!["prog".into(), "--name=a b".into(), "$(id)".into()],
            ..Default::default()
        };
        assert_eq!(
            sp.build_command(&req, 1),
            "prog '--name=a b' '$(id)' --ip=0.0.0.0 --port=1"
        );
    }

    #[test]
    fn test_build_environment_overrides() {
        let mock = Arc::new(MockExecutor::new());
        let mut cfg = config();
        cfg.hub_api_url = Some("http://hub:1/api".into());
        let sp = spawner_with(cfg, mock);
        let staged = StagedCerts {
            keyfile: ".res/k".into(),
            cafile: ".res/ca".into(),
        };
        let env = sp.build_environment(&request(), Some(&staged));
        assert_eq!(env[HUB_API_URL_ENV], "http://hub:1/api");
        assert_eq!(env["PATH"], crate::constants::DEFAULT_REMOTE_PATH);
        assert_eq!(env[SSL_KEYFILE_ENV], ".res/k");
        assert_eq!(env[SSL_CLIENT_CA_ENV], ".res/ca");
        assert_eq!(env["API_TOKEN"], "tok");
    }

    #[tokio::test]
    async fn test_poll_without_pid_makes_no_call() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        assert_eq!(sp.poll().await, PollStatus::NotRunning);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_poll_alive_keeps_session() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "", 0));
        let mut sp = running(&mock);
        let before = sp.session().clone();

        assert_eq!(sp.poll().await, PollStatus::Running);
        assert_eq!(sp.session(), &before);
        assert_eq!(sp.phase(), Phase::Running);

        let calls = mock.calls();
        assert_eq!(calls[0].target.host, "10.0.0.5");
        assert_eq!(calls[0].payload, Payload::Command("kill -s 0 4821 < /dev/null".into()));
    }

    #[tokio::test]
    async fn test_poll_nonzero_clears() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "kill: (4821) - No such process", 1));
        let mut sp = running(&mock);

        let status = sp.poll().await;
        assert_eq!(status, PollStatus::Exited);
        assert_eq!(status.exit_code(), Some(0));
        assert_eq!(sp.get_state().pid, None);
        assert_eq!(sp.session().pid(), 0);
        assert_eq!(sp.session().remote_address(), None);
        assert_eq!(sp.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_poll_transport_error_clears_by_default() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("no route to host"));
        let mut sp = running(&mock);
        assert_eq!(sp.poll().await, PollStatus::Exited);
        assert_eq!(sp.session().pid(), 0);
    }

    #[tokio::test]
    async fn test_poll_policy_tolerates_transient_loss() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("timeout"));
        mock.push(MockReply::output("", "", 0));
        mock.push(MockReply::unreachable("timeout"));
        mock.push(MockReply::unreachable("timeout"));
        let mut cfg = config();
        cfg.poll_policy.transport_failures_before_exit = 2;
        let mut sp = spawner_with(cfg, Arc::clone(&mock));
        sp.load_state(&PersistedState {
            pid: Some(4821),
            remote_address: Some("10.0.0.5".into()),
        });

        let first = sp.poll().await;
        assert_eq!(first, PollStatus::Unreachable { consecutive: 1 });
        assert!(first.is_alive());
        assert_eq!(sp.poll().await, PollStatus::Running);
        assert_eq!(sp.poll().await, PollStatus::Unreachable { consecutive: 1 });
        assert_eq!(sp.poll().await, PollStatus::Exited);
        assert_eq!(sp.session().pid(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_even_when_signal_fails() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("connection refused"));
        let mut sp = running(&mock);

        sp.stop().await;
        assert_eq!(sp.phase(), Phase::Idle);
        assert!(sp.get_state().is_empty());
        assert_eq!(
            mock.calls()[0].payload,
            Payload::Command("kill -s 15 4821 < /dev/null".into())
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = spawner_with(config(), Arc::clone(&mock));
        sp.stop().await;
        sp.stop().await;
        assert_eq!(sp.phase(), Phase::Idle);
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_clear_state_keeps_host() {
        let mock = Arc::new(MockExecutor::new());
        let mut sp = running(&mock);
        sp.session.set_remote_host("h2");
        sp.clear_state();
        assert_eq!(sp.session().pid(), 0);
        assert_eq!(sp.session().remote_address(), None);
        assert_eq!(sp.session().remote_host(), Some("h2"));
    }
}
