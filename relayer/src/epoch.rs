//! Resolution of the P-Chain height a destination chain currently uses to select validators.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonrpsee::{
    core::client::ClientT,
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{serde_util::num_as_str, validators::PChainHeight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    #[serde(with = "num_as_str")]
    pub number: u64,
    /// Unix timestamp in seconds.
    #[serde(with = "num_as_str")]
    pub start_time: u64,
    #[serde(rename = "pChainHeight", with = "num_as_str")]
    pub p_chain_height: u64,
}

impl Epoch {
    /// The height validators are selected at during this epoch. Before the first epoch has started, the proposed
    /// state is used.
    pub fn validator_height(&self) -> PChainHeight {
        if self.number == 0 {
            PChainHeight::Current
        } else {
            PChainHeight::At(self.p_chain_height)
        }
    }

    /// `None` if the end is not representable.
    fn end(&self, duration: Duration) -> Option<SystemTime> {
        UNIX_EPOCH
            .checked_add(Duration::from_secs(self.start_time))?
            .checked_add(duration)
    }
}

#[async_trait]
pub trait EpochClient: Send + Sync + 'static {
    async fn current_epoch(&self) -> Result<Epoch>;
}

/// Reads epochs from a chain's ProposerVM API.
pub struct ProposerVmClient {
    client: HttpClient,
}

impl ProposerVmClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(ProposerVmClient {
            client: HttpClientBuilder::default()
                .request_timeout(timeout)
                .build(url)
                .with_context(|| format!("invalid epoch API url {url}"))?,
        })
    }
}

#[async_trait]
impl EpochClient for ProposerVmClient {
    async fn current_epoch(&self) -> Result<Epoch> {
        self.client
            .request("proposervm.getCurrentEpoch", rpc_params![])
            .await
            .context("proposervm.getCurrentEpoch")
    }
}

/// Caches the current epoch until it ends. Concurrent callers share a single in-flight fetch.
pub struct EpochResolver {
    client: Arc<dyn EpochClient>,
    epoch_duration: Duration,
    current: Mutex<Option<(Epoch, Instant)>>,
}

impl EpochResolver {
    pub fn new(client: Arc<dyn EpochClient>, epoch_duration: Duration) -> Self {
        EpochResolver {
            client,
            epoch_duration,
            current: Mutex::new(None),
        }
    }

    pub async fn current_epoch(&self) -> Result<Epoch> {
        // Holding the lock across the fetch makes every other caller wait for its result.
        let mut current = self.current.lock().await;
        if let Some((epoch, expiry)) = *current {
            if Instant::now() < expiry {
                return Ok(epoch);
            }
        }

        let epoch = self.client.current_epoch().await?;
        let Some(end) = epoch.end(self.epoch_duration) else {
            // Not cached, so the next call fetches again.
            warn!(
                number = epoch.number,
                start_time = epoch.start_time,
                "epoch end is out of range"
            );
            *current = None;
            return Ok(epoch);
        };
        let remaining = end.duration_since(SystemTime::now()).unwrap_or_default();
        debug!(
            number = epoch.number,
            p_chain_height = epoch.p_chain_height,
            ?remaining,
            "fetched current epoch"
        );
        *current = Instant::now()
            .checked_add(remaining)
            .map(|expiry| (epoch, expiry));
        Ok(epoch)
    }

    pub async fn p_chain_height(&self) -> Result<PChainHeight> {
        Ok(self.current_epoch().await?.validator_height())
    }
}
