//! Host selection for new sessions.

use rand::seq::SliceRandom;

/// Picks the host a fresh session negotiates against.
pub trait HostSelector: Send + Sync {
    /// `None` only when `candidates` is empty.
    fn choose(&self, candidates: &[String]) -> Option<String>;
}

/// Uniformly random, no health or load awareness.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformRandom;

impl HostSelector for UniformRandom {
    fn choose(&self, candidates: &[String]) -> Option<String> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Always the first candidate. Handy for single-host setups and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstHost;

impl HostSelector for FirstHost {
    fn choose(&self, candidates: &[String]) -> Option<String> {
        candidates.first().cloned()
    }
}
