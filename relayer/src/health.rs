use dashmap::DashMap;
use tracing::{info, warn};

use crate::crypto::Id;

/// Per-chain health flags, flipped by listeners and signers and read by whatever reports the relayer's health.
#[derive(Debug, Default)]
pub struct HealthTracker {
    chains: DashMap<Id, bool>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `chain`. Chains begin healthy.
    pub fn register(&self, chain: Id) {
        self.chains.entry(chain).or_insert(true);
    }

    pub fn mark_healthy(&self, chain: Id) {
        if self.chains.insert(chain, true) == Some(false) {
            info!(%chain, "chain recovered");
        }
    }

    pub fn mark_unhealthy(&self, chain: Id) {
        if self.chains.insert(chain, false) != Some(false) {
            warn!(%chain, "chain marked unhealthy");
        }
    }

    /// Unknown chains are reported as unhealthy.
    pub fn is_healthy(&self, chain: Id) -> bool {
        self.chains.get(&chain).is_some_and(|h| *h)
    }

    pub fn all_healthy(&self) -> bool {
        self.chains.iter().all(|h| *h.value())
    }

    pub fn unhealthy(&self) -> Vec<Id> {
        let mut unhealthy: Vec<_> = self
            .chains
            .iter()
            .filter(|h| !*h.value())
            .map(|h| *h.key())
            .collect();
        unhealthy.sort();
        unhealthy
    }
}
