//! The per-user session record and its persisted form.
//!
//! Only `pid` and `remote_address` survive a manager restart; everything
//! else is recomputed by the next start.

use serde::{Deserialize, Serialize};

use crate::identity::{self, RemoteIdentity};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Fields handed to the control plane for persistence.
///
/// `remote_ip` is accepted on load for records written by older managers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "remote_ip")]
    pub remote_address: Option<String>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.remote_address.is_none()
    }
}

/// One user's remote process, as far as the manager knows.
///
/// `pid == 0` means no known process; `remote_port == 0` means unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    logical_user: String,
    remote_identity: RemoteIdentity,
    remote_host: Option<String>,
    remote_address: Option<String>,
    remote_port: u16,
    pid: u32,
    resource_path: String,
}

impl Session {
    pub fn new(logical_user: impl Into<String>, resource_path: impl Into<String>) -> Self {
        let logical_user = logical_user.into();
        Self {
            remote_identity: identity::resolve(&logical_user),
            logical_user,
            remote_host: None,
            remote_address: None,
            remote_port: 0,
            pid: 0,
            resource_path: resource_path.into(),
        }
    }

    pub fn logical_user(&self) -> &str {
        &self.logical_user
    }

    pub fn remote_identity(&self) -> &RemoteIdentity {
        &self.remote_identity
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    /// A process is believed alive at `remote_address`.
    pub fn is_running(&self) -> bool {
        self.pid != 0 && self.remote_address.is_some()
    }

    pub fn set_remote_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        tracing::debug!(user = %self.logical_user, "remote host was set to {}", host);
        self.remote_host = Some(host);
    }

    pub fn set_remote_address(&mut self, address: impl Into<String>) {
        let address = address.into();
        tracing::debug!(user = %self.logical_user, "remote address was set to {}", address);
        self.remote_address = Some(address);
    }

    pub fn set_remote_port(&mut self, port: u16) {
        tracing::debug!(user = %self.logical_user, "remote port was set to {}", port);
        self.remote_port = port;
    }

    pub fn set_pid(&mut self, pid: u32) {
        tracing::debug!(user = %self.logical_user, "pid was set to {}", pid);
        self.pid = pid;
    }

    /// Snapshot of the persisted fields. Unset fields are omitted.
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            pid: (self.pid != 0).then_some(self.pid),
            remote_address: self.remote_address.clone(),
        }
    }

    /// Copy known fields from a persisted record.
    pub fn load(&mut self, state: &PersistedState) {
        if let Some(pid) = state.pid {
            self.set_pid(pid);
        }
        if let Some(address) = &state.remote_address {
            self.set_remote_address(address.clone());
        }
    }

    /// Forget the process. Host and identity are kept for diagnostics.
    pub fn clear(&mut self) {
        tracing::debug!(user = %self.logical_user, pid = self.pid, "clearing session");
        self.remote_address = None;
        self.remote_port = 0;
        self.pid = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_idle() {
        let s = Session::new("amy", ".res");
        assert!(!s.is_running());
        assert_eq!(s.pid(), 0);
        assert_eq!(s.remote_port(), 0);
        assert!(s.persisted().is_empty());
        assert_eq!(s.remote_identity(), &identity::resolve("amy"));
    }

    #[test]
    fn test_persisted_roundtrip_through_load() {
        let mut s = Session::new("amy", ".res");
        s.set_remote_address("10.0.0.5");
        s.set_pid(4821);
        let state = s.persisted();

        let mut restored = Session::new("amy", ".res");
        restored.load(&state);
        assert_eq!(restored.pid(), 4821);
        assert_eq!(restored.remote_address(), Some("10.0.0.5"));
        assert!(restored.is_running());
    }

    #[test]
    fn test_clear_keeps_host_and_identity() {
        let mut s = Session::new("amy", ".res");
        s.set_remote_host("h1");
        s.set_remote_address("10.0.0.5");
        s.set_remote_port(37281);
        s.set_pid(4821);
        s.clear();
        assert_eq!(s.pid(), 0);
        assert_eq!(s.remote_port(), 0);
        assert_eq!(s.remote_address(), None);
        assert_eq!(s.remote_host(), Some("h1"));
        assert_eq!(s.remote_identity(), &identity::resolve("amy"));
    }

    #[test]
    fn test_persisted_json_shape() {
        let state = PersistedState {
            pid: Some(4821),
            remote_address: Some("10.0.0.5".into()),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({"pid": 4821, "remote_address": "10.0.0.5"}));

        let empty = serde_json::to_value(PersistedState::default()).unwrap();
        assert_eq!(empty, serde_json::json!({}));
    }

    #[test]
    fn test_load_accepts_legacy_key() {
        let state: PersistedState =
            serde_json::from_str(r#"{"pid": 12, "remote_ip": "192.168.1.9", "extra": true}"#).unwrap();
        assert_eq!(state.pid, Some(12));
        assert_eq!(state.remote_address.as_deref(), Some("192.168.1.9"));
    }
}
