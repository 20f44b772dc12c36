//! The relayer's view of validator connectivity: which subnets it tracks, the validators currently registered for
//! each of them and how much of their stake it is connected to.

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::*;

use crate::{
    constants::MAX_TRACKED_SUBNETS,
    crypto::{Id, NodeId},
    error::ValidatorError,
    validators::{
        CanonicalValidatorSet, CanonicalValidators, PChainHeight, ValidatorInfo,
        build_canonical_validators, client::PeerNetwork, manager::ValidatorManager,
    },
};

/// A bounded set of subnets, evicting the least recently touched subnet when full.
///
/// `set` and the keys of `lru` always hold the same subnets.
#[derive(Debug)]
struct TrackedSubnets {
    set: HashSet<Id>,
    lru: LruCache<Id, ()>,
}

impl TrackedSubnets {
    fn new(capacity: NonZeroUsize) -> Self {
        TrackedSubnets {
            set: HashSet::with_capacity(capacity.get()),
            lru: LruCache::new(capacity),
        }
    }

    /// Track `subnet`, refreshing its recency if it is already tracked. Returns whether it was already tracked and
    /// the subnet evicted to make room for it, if any.
    fn track(&mut self, subnet: Id) -> (bool, Option<Id>) {
        if self.set.contains(&subnet) {
            self.lru.promote(&subnet);
            return (true, None);
        }
        let evicted = if self.lru.len() >= self.lru.cap().get() {
            self.lru.pop_lru().map(|(evicted, ())| evicted)
        } else {
            None
        };
        if let Some(evicted) = evicted {
            self.set.remove(&evicted);
        }
        self.set.insert(subnet);
        self.lru.put(subnet, ());
        (false, evicted)
    }
}

/// The validators currently registered for each tracked subnet.
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    subnets: HashMap<Id, HashMap<NodeId, ValidatorInfo>>,
}

impl ValidatorRegistry {
    /// Bring the registered validators of `subnet` in line with `new_set`. Returns the number of nodes added and
    /// removed.
    pub fn update_tracked_validators(
        &mut self,
        subnet: Id,
        new_set: &[ValidatorInfo],
    ) -> (usize, usize) {
        let registered = self.subnets.entry(subnet).or_default();
        let new_nodes: HashMap<NodeId, &ValidatorInfo> =
            new_set.iter().map(|v| (v.node_id, v)).collect();

        let before = registered.len();
        registered.retain(|node_id, _| new_nodes.contains_key(node_id));
        let removed = before - registered.len();

        let mut added = 0;
        for (node_id, validator) in new_nodes {
            match registered.get_mut(&node_id) {
                Some(existing) => {
                    if *existing != *validator {
                        *existing = validator.clone();
                    }
                }
                None => {
                    registered.insert(node_id, validator.clone());
                    added += 1;
                }
            }
        }
        (added, removed)
    }

    pub fn remove_subnet(&mut self, subnet: Id) -> Option<HashMap<NodeId, ValidatorInfo>> {
        self.subnets.remove(&subnet)
    }

    pub fn validators(&self, subnet: Id) -> impl Iterator<Item = &ValidatorInfo> {
        self.subnets.get(&subnet).into_iter().flat_map(|v| v.values())
    }

    pub fn contains_subnet(&self, subnet: Id) -> bool {
        self.subnets.contains_key(&subnet)
    }
}

pub struct AppRequestNetwork {
    peers: Arc<dyn PeerNetwork>,
    validators: Arc<ValidatorManager>,
    /// Lock order: `tracked` before `registry`.
    tracked: RwLock<TrackedSubnets>,
    registry: Mutex<ValidatorRegistry>,
    quorum_numerator: u64,
    quorum_denominator: u64,
}

impl AppRequestNetwork {
    pub fn new(
        peers: Arc<dyn PeerNetwork>,
        validators: Arc<ValidatorManager>,
        quorum_numerator: u64,
        quorum_denominator: u64,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_SUBNETS).unwrap_or(NonZeroUsize::MIN);
        AppRequestNetwork {
            peers,
            validators,
            tracked: RwLock::new(TrackedSubnets::new(capacity)),
            registry: Mutex::new(ValidatorRegistry::default()),
            quorum_numerator,
            quorum_denominator,
        }
    }

    pub fn validator_manager(&self) -> &Arc<ValidatorManager> {
        &self.validators
    }

    /// Start tracking `subnet`. Returns whether it was already tracked.
    pub fn track_subnet(&self, subnet: Id) -> bool {
        let mut tracked = self.tracked.write();
        let (already_tracked, evicted) = tracked.track(subnet);
        if let Some(evicted) = evicted {
            info!(%evicted, %subnet, "evicting least recently used subnet");
            self.registry.lock().remove_subnet(evicted);
        }
        already_tracked
    }

    pub fn is_tracked(&self, subnet: Id) -> bool {
        self.tracked.read().set.contains(&subnet)
    }

    pub fn tracked_subnets(&self) -> Vec<Id> {
        let mut subnets: Vec<_> = self.tracked.read().set.iter().copied().collect();
        subnets.sort();
        subnets
    }

    /// Fetch the current validators of `subnet` and update the registry with them.
    pub async fn refresh_tracked_validators(&self, subnet: Id) -> Result<(), ValidatorError> {
        let validators = self
            .validators
            .client()
            .validators_at(subnet, PChainHeight::Current)
            .await
            .map_err(ValidatorError::Fetch)?;

        let tracked = self.tracked.read();
        // The subnet may have been evicted while we were fetching.
        if !tracked.set.contains(&subnet) {
            debug!(%subnet, "subnet no longer tracked, discarding validators");
            return Ok(());
        }
        let (added, removed) = self
            .registry
            .lock()
            .update_tracked_validators(subnet, &validators);
        if added > 0 || removed > 0 {
            debug!(%subnet, added, removed, "updated tracked validators");
        }
        Ok(())
    }

    /// The canonical validators of `subnet` at `height`, with the weight of those we are connected to.
    pub async fn get_canonical_validators(
        &self,
        subnet: Id,
        height: PChainHeight,
    ) -> Result<CanonicalValidators, ValidatorError> {
        if !self.track_subnet(subnet) {
            if let Err(e) = self.refresh_tracked_validators(subnet).await {
                warn!(%subnet, "failed to fetch validators of newly tracked subnet: {e}");
            }
        }

        let validator_set = self.validators.validator_set(subnet, height).await?;
        let connected = self
            .peers
            .connected_peers()
            .await
            .map_err(ValidatorError::Fetch)?;
        let validators = build_canonical_validators(validator_set, &connected);
        trace!(
            %subnet,
            %height,
            connected_weight = validators.connected_weight,
            total_weight = validators.total_weight(),
            "canonical validators"
        );
        Ok(validators)
    }

    /// Fail unless we are connected to a quorum of `validators`.
    pub fn check_quorum(
        &self,
        subnet: Id,
        validators: &CanonicalValidators,
    ) -> Result<(), ValidatorError> {
        if validators.connected_weight_meets_quorum(self.quorum_numerator, self.quorum_denominator)
        {
            Ok(())
        } else {
            Err(ValidatorError::InsufficientWeight {
                subnet,
                connected: validators.connected_weight,
                total: validators.total_weight(),
                numerator: self.quorum_numerator,
                denominator: self.quorum_denominator,
            })
        }
    }

    /// Whether we are connected to a quorum of the validators currently registered for `subnet`.
    pub async fn connected_to_quorum(&self, subnet: Id) -> Result<bool, ValidatorError> {
        let validator_set = {
            let validators: Vec<ValidatorInfo> =
                self.registry.lock().validators(subnet).cloned().collect();
            CanonicalValidatorSet::from_validators(subnet, &validators)?
        };
        let connected = self
            .peers
            .connected_peers()
            .await
            .map_err(ValidatorError::Fetch)?;
        let validators = build_canonical_validators(validator_set, &connected);
        Ok(self.check_quorum(subnet, &validators).is_ok())
    }

    /// Periodically refresh the registered validators of every tracked subnet. Failures are logged and the previous
    /// validators stay in place.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for subnet in self.tracked_subnets() {
                    if let Err(e) = self.refresh_tracked_validators(subnet).await {
                        warn!(%subnet, "failed to refresh tracked validators: {e}");
                    }
                }
            }
        })
    }
}
