//! Server host key verification.
//!
//! The spawner historically connected with host key checking turned off.
//! That stays the default ([`AcceptAnyHostKey`]) but it is a policy object
//! now, so a deployment can pin fingerprints per host.

use std::collections::{HashMap, HashSet};

/// Decides whether a server's host key is acceptable.
///
/// `fingerprint` is the OpenSSH SHA-256 form, e.g. `SHA256:abc...`.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, fingerprint: &str) -> bool;

    /// True if this verifier performs no checking at all.
    fn is_unverified(&self) -> bool {
        false
    }
}

/// Accepts any key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host: &str, fingerprint: &str) -> bool {
        // SECURITY: no known_hosts check at all, not even trust-on-first-use.
        tracing::warn!(host, fingerprint, "accepting server key without verification");
        true
    }

    fn is_unverified(&self) -> bool {
        true
    }
}

/// Accepts only fingerprints listed for the host. Unlisted hosts are rejected.
#[derive(Debug, Default, Clone)]
pub struct PinnedHostKeys {
    pins: HashMap<String, HashSet<String>>,
}

impl PinnedHostKeys {
    pub fn new(pins: HashMap<String, Vec<String>>) -> Self {
        Self {
            pins: pins
                .into_iter()
                .map(|(host, fps)| (host, fps.into_iter().collect()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl HostKeyVerifier for PinnedHostKeys {
    fn verify(&self, host: &str, fingerprint: &str) -> bool {
        let ok = self
            .pins
            .get(host)
            .is_some_and(|fps| fps.contains(fingerprint));
        if !ok {
            tracing::error!(host, fingerprint, "host key not pinned for this host");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_any() {
        assert!(AcceptAnyHostKey.verify("h1", "SHA256:whatever"));
        assert!(AcceptAnyHostKey.is_unverified());
    }

    #[test]
    fn test_pinned_matches_per_host() {
        let pins = PinnedHostKeys::new(HashMap::from([(
            "10.0.0.5".to_string(),
            vec!["SHA256:good".to_string()],
        )]));
        assert!(pins.verify("10.0.0.5", "SHA256:good"));
        assert!(!pins.verify("10.0.0.5", "SHA256:evil"));
        assert!(!pins.verify("10.0.0.6", "SHA256:good"));
        assert!(!pins.is_unverified());
    }
}
