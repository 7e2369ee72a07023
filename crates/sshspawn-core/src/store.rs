//! Durable storage of persisted session state, keyed by logical user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::identity;
use crate::session::PersistedState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state I/O error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("corrupt state at {path}: {source}")]
    Corrupt { path: PathBuf, source: serde_json::Error },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, user: &str) -> Result<Option<PersistedState>, StoreError>;
    /// Save, or remove when `state` is empty.
    async fn save(&self, user: &str, state: &PersistedState) -> Result<(), StoreError>;
}

/// One JSON file per user under a directory.
///
/// Files are named by the remote identity so arbitrary user names never
/// reach the filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, user: &str) -> PathBuf {
        self.dir.join(format!("{}.json", identity::resolve(user)))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, user: &str) -> Result<Option<PersistedState>, StoreError> {
        let path = self.path_for(user);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Corrupt { path, source })?;
        Ok(Some(state))
    }

    async fn save(&self, user: &str, state: &PersistedState) -> Result<(), StoreError> {
        let path = self.path_for(user);
        if state.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io { path, source }),
            };
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io { path: self.dir.clone(), source })?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;

        // Readers only ever see a complete record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })?;
        Ok(())
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, PersistedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, user: &str) -> Result<Option<PersistedState>, StoreError> {
        Ok(self.states.read().await.get(user).cloned())
    }

    async fn save(&self, user: &str, state: &PersistedState) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        if state.is_empty() {
            states.remove(user);
        } else {
            states.insert(user.to_string(), state.clone());
        }
        Ok(())
    }
}
