use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::*;

use super::{
    CanonicalValidatorSet, PChainHeight, SubnetValidators, client::PChainClient,
};
use crate::{constants::VALIDATOR_SET_CACHE_SIZE, crypto::Id, error::ValidatorError};

/// Validator sets at historical P-Chain heights, evicted in insertion order.
#[derive(Debug)]
struct ValidatorSetCache {
    capacity: usize,
    order: VecDeque<u64>,
    sets: HashMap<u64, Arc<SubnetValidators>>,
}

impl ValidatorSetCache {
    fn new(capacity: usize) -> Self {
        ValidatorSetCache {
            capacity,
            order: VecDeque::with_capacity(capacity),
            sets: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, height: u64) -> Option<Arc<SubnetValidators>> {
        self.sets.get(&height).cloned()
    }

    /// Returns the cached value, which may have been inserted by a concurrent fetch of the same height.
    fn insert(&mut self, height: u64, sets: Arc<SubnetValidators>) -> Arc<SubnetValidators> {
        if let Some(existing) = self.sets.get(&height) {
            return existing.clone();
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.sets.remove(&oldest);
            }
        }
        self.order.push_back(height);
        self.sets.insert(height, sets.clone());
        sets
    }
}

pub struct ValidatorManager {
    client: Arc<dyn PChainClient>,
    cache: Mutex<ValidatorSetCache>,
    latest_synced_height: AtomicU64,
}

impl ValidatorManager {
    pub fn new(client: Arc<dyn PChainClient>) -> Self {
        Self::with_cache_size(client, VALIDATOR_SET_CACHE_SIZE)
    }

    pub fn with_cache_size(client: Arc<dyn PChainClient>, cache_size: usize) -> Self {
        ValidatorManager {
            client,
            cache: Mutex::new(ValidatorSetCache::new(cache_size.max(1))),
            latest_synced_height: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<dyn PChainClient> {
        &self.client
    }

    /// The highest P-Chain height whose validator sets have been fetched.
    pub fn latest_synced_height(&self) -> u64 {
        self.latest_synced_height.load(Ordering::Acquire)
    }

    fn advance_latest_synced_height(&self, height: u64) {
        let mut current = self.latest_synced_height.load(Ordering::Acquire);
        while height > current {
            match self.latest_synced_height.compare_exchange_weak(
                current,
                height,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(height, "advanced latest synced P-Chain height");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// The validator sets of every subnet at `height`.
    ///
    /// [PChainHeight::Current] is always fetched, since the proposed state can change. Specific heights are served
    /// from the cache if possible.
    pub async fn get_all_validator_sets(
        &self,
        height: PChainHeight,
    ) -> Result<Arc<SubnetValidators>, ValidatorError> {
        let at = match height {
            PChainHeight::Current => {
                let sets = self
                    .client
                    .all_validators_at(PChainHeight::Current)
                    .await
                    .map_err(ValidatorError::Fetch)?;
                return Ok(Arc::new(sets));
            }
            PChainHeight::At(at) => at,
        };

        if let Some(sets) = self.cache.lock().get(at) {
            return Ok(sets);
        }

        debug!(height = at, "fetching validator sets");
        let sets = self
            .client
            .all_validators_at(height)
            .await
            .map_err(ValidatorError::Fetch)?;
        let sets = self.cache.lock().insert(at, Arc::new(sets));
        self.advance_latest_synced_height(at);
        Ok(sets)
    }

    /// The canonical validator set of `subnet` at `height`.
    pub async fn validator_set(
        &self,
        subnet: Id,
        height: PChainHeight,
    ) -> Result<CanonicalValidatorSet, ValidatorError> {
        let sets = self.get_all_validator_sets(height).await?;
        let validators = sets
            .get(&subnet)
            .ok_or(ValidatorError::UnknownSubnet { subnet, height })?;
        CanonicalValidatorSet::from_validators(subnet, validators)
    }

    /// Prefetch the validator sets at the latest P-Chain height.
    pub async fn sync_latest(&self) -> Result<u64, ValidatorError> {
        let height = self.client.height().await.map_err(ValidatorError::Fetch)?;
        self.get_all_validator_sets(PChainHeight::At(height)).await?;
        Ok(height)
    }

    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sync_latest().await {
                    Ok(height) => debug!(height, "synced validator sets"),
                    Err(e) => warn!("failed to sync validator sets: {e}"),
                }
            }
        })
    }
}
