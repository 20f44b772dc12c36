use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes, TxHash, U256},
    providers::{Provider, ProviderBuilder},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::retry::timed;

/// The parts of a transaction receipt a relayer reports back to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
}

/// The operations a signer needs from a destination chain.
#[async_trait]
pub trait DestinationRpc: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<u64>;

    /// The next nonce of `address`, including pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    async fn suggest_gas_tip_cap(&self) -> Result<u128>;

    async fn estimate_base_fee(&self) -> Result<u128>;

    async fn send_raw_transaction(&self, encoded: Bytes) -> Result<TxHash>;

    /// `None` until the transaction has been included in a block.
    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<DeliveryReceipt>>;
}

pub struct HttpDestinationRpc<P> {
    rpc_url: String,
    provider: P,
    rpc_timeout: Duration,
}

pub fn connect(rpc_url: &str, rpc_timeout: Duration) -> Result<Arc<dyn DestinationRpc>> {
    info!(rpc_url, "connecting to destination chain");
    let url = rpc_url
        .parse()
        .with_context(|| format!("invalid destination url {rpc_url}"))?;
    let provider = ProviderBuilder::default().on_http(url);
    Ok(Arc::new(HttpDestinationRpc {
        rpc_url: rpc_url.to_owned(),
        provider,
        rpc_timeout,
    }))
}

impl<P> HttpDestinationRpc<P> {
    async fn timed<T, E>(&self, call: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        timed(&self.rpc_url, self.rpc_timeout, call).await
    }
}

#[async_trait]
impl<P: Provider + 'static> DestinationRpc for HttpDestinationRpc<P> {
    async fn chain_id(&self) -> Result<u64> {
        self.timed(self.provider.get_chain_id()).await
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        self.timed(
            self.provider
                .get_transaction_count(address)
                .pending()
                .into_future(),
        )
        .await
    }

    async fn suggest_gas_tip_cap(&self) -> Result<u128> {
        self.timed(self.provider.get_max_priority_fee_per_gas())
            .await
    }

    async fn estimate_base_fee(&self) -> Result<u128> {
        let base_fee: U256 = self
            .timed(self.provider.raw_request("eth_baseFee".into(), [(); 0]))
            .await?;
        u128::try_from(base_fee).context("base fee does not fit in 128 bits")
    }

    async fn send_raw_transaction(&self, encoded: Bytes) -> Result<TxHash> {
        let pending = self
            .timed(self.provider.send_raw_transaction(&encoded))
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<DeliveryReceipt>> {
        let receipt = self
            .timed(self.provider.get_transaction_receipt(tx_hash))
            .await?;
        Ok(receipt.map(|receipt| DeliveryReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.unwrap_or_default(),
            gas_used: receipt.gas_used,
            success: receipt.status(),
        }))
    }
}
