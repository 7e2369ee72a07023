//! Per-user spawners with serialized operations and durable state.
//!
//! Each user gets one [`Spawner`] behind its own `tokio::sync::Mutex`, so
//! start/poll/stop for one user never overlap while different users run
//! fully concurrently. The map itself is a `DashMap`; no lock is held
//! across SSH I/O except the user's own.
//!
//! The manager plays the orchestrator role: it is where a failed start may
//! be retried (per [`RetryPolicy`]) and where state is written back to the
//! [`StateStore`] after every transition.
//!
//! A user's slot is dropped once the user has no process and no caller
//! waiting on the slot; the next operation reloads it from the store.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::{RetryPolicy, SpawnerConfig};
use crate::error::SpawnError;
use crate::negotiate::Endpoint;
use crate::placement::{HostSelector, UniformRandom};
use crate::session::PersistedState;
use crate::spawner::{LaunchRequest, PollStatus, Spawner};
use crate::ssh::SshExecutor;
use crate::staging::StagedCerts;
use crate::store::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Slot {
    spawner: Spawner,
    loaded: bool,
}

pub struct SessionManager {
    config: Arc<SpawnerConfig>,
    executor: Arc<dyn SshExecutor>,
    selector: Arc<dyn HostSelector>,
    store: Arc<dyn StateStore>,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<SpawnerConfig>,
        executor: Arc<dyn SshExecutor>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            executor,
            selector: Arc::new(UniformRandom),
            store,
            slots: DashMap::new(),
        }
    }

    /// Replace the host selection strategy.
    pub fn with_selector(mut self, selector: Arc<dyn HostSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    fn slot(&self, user: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(user) {
            return Arc::clone(slot.value());
        }
        let entry = self.slots.entry(user.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                spawner: Spawner::new(
                    user,
                    Arc::clone(&self.config),
                    Arc::clone(&self.executor),
                    Arc::clone(&self.selector),
                ),
                loaded: false,
            }))
        });
        Arc::clone(entry.value())
    }

    /// Lock the user's slot, pulling persisted state in on first use.
    async fn locked(&self, user: &str) -> Result<tokio::sync::OwnedMutexGuard<Slot>, StoreError> {
        let mut slot = self.slot(user).lock_owned().await;
        if !slot.loaded {
            match self.store.load(user).await {
                Ok(Some(state)) => {
                    tracing::debug!(user, ?state, "loaded persisted state");
                    slot.spawner.load_state(&state);
                }
                Ok(None) => {}
                // Unreadable record: the user starts from nothing, and the
                // next write replaces it.
                Err(e @ StoreError::Corrupt { .. }) => {
                    tracing::warn!(user, "discarding persisted state: {}", e);
                }
                Err(e) => return Err(e),
            }
            slot.loaded = true;
        }
        Ok(slot)
    }

    /// Drop the user's slot if it holds no process and nobody else holds it.
    fn evict_if_idle(&self, user: &str) {
        let removed = self.slots.remove_if(user, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().is_ok_and(|s| !s.spawner.session().is_running())
        });
        if removed.is_some() {
            tracing::trace!(user, "evicted idle slot");
        }
    }

    async fn persist(&self, user: &str, spawner: &Spawner) -> Result<(), StoreError> {
        self.store.save(user, &spawner.get_state()).await
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn start(&self, user: &str, request: &LaunchRequest) -> Result<Endpoint, ManagerError> {
        let mut slot = self.locked(user).await?;
        slot.spawner.ensure_idle()?;
        let staged = slot.spawner.stage_certs(request).await?;
        let endpoint = start_with_retry(
            &mut slot.spawner,
            request,
            staged.as_ref(),
            self.config.start_retry,
        )
        .await?;
        self.persist(user, &slot.spawner).await?;
        Ok(endpoint)
    }

    #[tracing::instrument(skip(self))]
    pub async fn poll(&self, user: &str) -> Result<PollStatus, ManagerError> {
        let mut slot = self.locked(user).await?;
        let status = slot.spawner.poll().await;
        if !status.is_alive() {
            self.persist(user, &slot.spawner).await?;
            drop(slot);
            self.evict_if_idle(user);
        }
        Ok(status)
    }

    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, user: &str) -> Result<(), ManagerError> {
        let mut slot = self.locked(user).await?;
        slot.spawner.stop().await;
        self.persist(user, &slot.spawner).await?;
        drop(slot);
        self.evict_if_idle(user);
        Ok(())
    }

    pub async fn get_state(&self, user: &str) -> Result<PersistedState, ManagerError> {
        let slot = self.locked(user).await?;
        Ok(slot.spawner.get_state())
    }

    pub async fn load_state(&self, user: &str, state: &PersistedState) -> Result<(), ManagerError> {
        let mut slot = self.locked(user).await?;
        slot.spawner.load_state(state);
        self.persist(user, &slot.spawner).await?;
        Ok(())
    }

    pub async fn clear_state(&self, user: &str) -> Result<(), ManagerError> {
        let mut slot = self.locked(user).await?;
        slot.spawner.clear_state();
        self.persist(user, &slot.spawner).await?;
        drop(slot);
        self.evict_if_idle(user);
        Ok(())
    }

    /// Users with a slot in memory: running, or mid-operation.
    pub fn users(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }
}

/// Failures worth another attempt: the remote side, not our inputs.
fn is_retryable(err: &SpawnError) -> bool {
    matches!(
        err,
        SpawnError::Connection(_) | SpawnError::CommandFailure { .. } | SpawnError::Protocol(_)
    )
}

async fn start_with_retry(
    spawner: &mut Spawner,
    request: &LaunchRequest,
    staged: Option<&StagedCerts>,
    retry: RetryPolicy,
) -> Result<Endpoint, SpawnError> {
    let mut attempt = 0;
    loop {
        match spawner.start_staged(request, staged).await {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) if attempt < retry.retries && is_retryable(&e) => {
                attempt += 1;
                let delay = retry.delay(attempt);
                tracing::warn!(attempt, ?delay, "start failed, retrying: {}", e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::FirstHost;
    use crate::ssh::{MockExecutor, MockReply};
    use crate::staging::CertPaths;
    use crate::store::{JsonFileStore, MemoryStore};

    fn manager_with_store(mock: Arc<MockExecutor>, store: Arc<dyn StateStore>) -> SessionManager {
        let config = SpawnerConfig {
            remote_hosts: vec!["h1".into()],
            ..Default::default()
        };
        SessionManager::new(Arc::new(config), mock, store).with_selector(Arc::new(FirstHost))
    }

    fn manager(mock: Arc<MockExecutor>, store: Arc<MemoryStore>, retries: u32) -> SessionManager {
        let config = SpawnerConfig {
            remote_hosts: vec!["h1".into()],
            start_retry: RetryPolicy { retries, backoff_ms: 10 },
            ..Default::default()
        };
        SessionManager::new(Arc::new(config), mock, store).with_selector(Arc::new(FirstHost))
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            command: vec!["prog".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_persists_state() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("10.0.0.5 37281", "", 0));
        mock.push(MockReply::output("4821\n", "", 0));
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(mock, Arc::clone(&store), 0);

        mgr.start("amy", &request()).await.unwrap();
        let saved = store.load("amy").await.unwrap().unwrap();
        assert_eq!(saved.pid, Some(4821));
        assert_eq!(saved.remote_address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_failed_start_persists_nothing() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "bind: address in use", 1));
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(mock, Arc::clone(&store), 0);

        assert!(mgr.start("amy", &request()).await.is_err());
        assert_eq!(store.load("amy").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_remote_failures() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("connection refused"));
        mock.push(MockReply::output("10.0.0.5 37281", "", 0));
        mock.push(MockReply::output("4821\n", "", 0));
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(Arc::clone(&mock), store, 1);

        let ep = mgr.start("amy", &request()).await.unwrap();
        assert_eq!(ep.port, 37281);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_state_survives_manager_restart() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                "amy",
                &PersistedState { pid: Some(4821), remote_address: Some("10.0.0.5".into()) },
            )
            .await
            .unwrap();

        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "", 1));
        let mgr = manager(Arc::clone(&mock), Arc::clone(&store), 0);

        assert_eq!(mgr.poll("amy").await.unwrap(), PollStatus::Exited);
        assert_eq!(mock.calls()[0].target.host, "10.0.0.5");
        assert_eq!(mgr.get_state("amy").await.unwrap().pid, None);
        assert_eq!(store.load("amy").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("", "", 0));
        let mgr = manager(Arc::clone(&mock), Arc::clone(&store), 0);

        mgr.load_state(
            "amy",
            &PersistedState { pid: Some(7), remote_address: Some("10.0.0.9".into()) },
        )
        .await
        .unwrap();
        assert!(store.load("amy").await.unwrap().is_some());

        mgr.stop("amy").await.unwrap();
        assert!(mgr.get_state("amy").await.unwrap().is_empty());
        assert_eq!(store.load("amy").await.unwrap(), None);

        mgr.clear_state("amy").await.unwrap();
        assert!(mgr.users().is_empty());
    }

    #[tokio::test]
    async fn test_running_slot_is_kept() {
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::output("10.0.0.5 37281", "", 0));
        mock.push(MockReply::output("4821\n", "", 0));
        mock.push(MockReply::output("", "", 0));
        let mgr = manager(Arc::clone(&mock), Arc::new(MemoryStore::new()), 0);

        mgr.start("amy", &request()).await.unwrap();
        assert_eq!(mgr.poll("amy").await.unwrap(), PollStatus::Running);
        assert_eq!(mgr.users(), vec!["amy".to_string()]);

        assert_eq!(mgr.poll("bob").await.unwrap(), PollStatus::NotRunning);
        assert_eq!(mgr.users(), vec!["amy".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stages_certs_once() {
        let src = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let keyfile = src.path().join("user.key");
        let cafile = src.path().join("ca.pem");
        std::fs::write(&keyfile, "KEY").unwrap();
        std::fs::write(&cafile, "CA").unwrap();

        let config = SpawnerConfig {
            remote_hosts: vec!["h1".into()],
            staging_dir: Some(staging.path().to_path_buf()),
            start_retry: RetryPolicy { retries: 1, backoff_ms: 10 },
            ..Default::default()
        };
        let mock = Arc::new(MockExecutor::new());
        mock.push(MockReply::unreachable("connection refused"));
        mock.push(MockReply::output("10.0.0.5 37281", "", 0));
        mock.push(MockReply::output("4821\n", "", 0));
        let mgr = SessionManager::new(Arc::new(config), mock.clone(), Arc::new(MemoryStore::new()))
            .with_selector(Arc::new(FirstHost));

        let req = LaunchRequest {
            certs: Some(CertPaths { keyfile: keyfile.clone(), cafile }),
            ..request()
        };
        let ep = mgr.start("amy", &req).await.unwrap();
        assert_eq!(ep.port, 37281);
        assert_eq!(mock.call_count(), 3);

        assert!(!keyfile.exists());
        let staged_key = staging
            .path()
            .join(crate::identity::resolve("amy").as_str())
            .join("user.key");
        assert_eq!(std::fs::read_to_string(staged_key).unwrap(), "KEY");
        let script = mock.calls()[2].payload.stdin().unwrap().to_string();
        assert!(script.contains("JUPYTERHUB_SSL_KEYFILE="));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        std::fs::write(store.path_for("amy"), "{ truncated").unwrap();

        let mock = Arc::new(MockExecutor::new());
        let mgr = manager_with_store(Arc::clone(&mock), store.clone());

        assert!(mgr.get_state("amy").await.unwrap().is_empty());
        mgr.clear_state("amy").await.unwrap();
        assert!(!store.path_for("amy").exists());
        assert_eq!(mock.call_count(), 0);

        mgr.load_state(
            "amy",
            &PersistedState { pid: Some(7), remote_address: Some("10.0.0.9".into()) },
        )
        .await
        .unwrap();
        assert_eq!(store.load("amy").await.unwrap().unwrap().pid, Some(7));
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let mock = Arc::new(MockExecutor::new());
        let store = Arc::new(MemoryStore::new());
        let mgr = Arc::new(manager(mock, store, 0));

        // Hold amy's lock; bob must still make progress.
        let amy = mgr.locked("amy").await.unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(1), mgr.poll("bob"))
            .await
            .expect("bob blocked behind amy")
            .unwrap();
        assert_eq!(status, PollStatus::NotRunning);
        drop(amy);
    }
}
