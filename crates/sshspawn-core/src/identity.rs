//! Logical user → remote login identity.
//!
//! The remote hosts provision one account per logical user, named by a
//! digest of the user name. The digest is part of the contract with the
//! provisioning side and must never change:
//!
//! ```text
//! identity = hex(SHA-256(utf8(user))[..16])   // 32 lowercase hex chars
//! ```
//!
//! 32 characters keeps the result inside the POSIX login-name limit.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bytes of the SHA-256 digest kept in the identity.
const IDENTITY_BYTES: usize = 16;

/// Placeholder substituted in the key file template.
const USERNAME_PLACEHOLDER: &str = "{username}";

/// SSH login identity on the remote hosts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteIdentity(String);

impl RemoteIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemoteIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the remote identity for a logical user. Pure and total.
pub fn resolve(logical_user: &str) -> RemoteIdentity {
    let digest = Sha256::digest(logical_user.as_bytes());
    RemoteIdentity(hex::encode(&digest[..IDENTITY_BYTES]))
}

/// Expand the key file template for an identity.
///
/// `{username}` becomes the remote identity; `~` and `$VAR` are expanded
/// against the manager's own environment. Unknown variables are left as-is.
pub fn key_path(template: &str, identity: &RemoteIdentity) -> PathBuf {
    let substituted = template.replace(USERNAME_PLACEHOLDER, identity.as_str());
    let expanded = shellexpand::full(&substituted)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(&substituted).into_owned());
    PathBuf::from(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_deterministic() {
        assert_eq!(resolve("amy"), resolve("amy"));
        assert_ne!(resolve("amy"), resolve("amy2"));
    }

    #[test]
    fn test_resolve_known_vector() {
        // SHA-256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        assert_eq!(resolve("abc").as_str(), "ba7816bf8f01cfea414140de5dae2223");
    }

    #[test]
    fn test_resolve_shape() {
        for user in ["", "amy", "someone@example.org", "ユーザー"] {
            let id = resolve(user);
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_key_path_substitutes_identity() {
        let id = resolve("amy");
        let path = key_path("/etc/sshspawn/keys/{username}/id_ed25519", &id);
        assert_eq!(
            path,
            PathBuf::from(format!("/etc/sshspawn/keys/{}/id_ed25519", id))
        );
    }

    #[test]
    fn test_key_path_expands_tilde() {
        let id = resolve("amy");
        let path = key_path("~/.ssh/id_rsa", &id);
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with(".ssh/id_rsa"));
    }
}
