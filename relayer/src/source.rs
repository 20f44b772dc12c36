//! Access to a source chain's JSON-RPC endpoint.

use std::{future::Future, sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, B256},
    providers::{Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log},
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tracing::info;

use crate::{
    message::{BlockHead, RawLog, warp_topic},
    retry::timed,
};

/// The operations the subscriber needs from a source chain.
#[async_trait]
pub trait SourceClient: Send + Sync + 'static {
    /// Open a new subscription to block heads. The returned stream ends when the subscription is lost.
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, BlockHead>>;

    /// Warp logs emitted by `address` in blocks `from..=to`.
    async fn warp_logs_in_range(&self, address: Address, from: u64, to: u64)
    -> Result<Vec<RawLog>>;

    /// Warp logs emitted by `address` in the block with the given hash.
    async fn warp_logs_in_block(&self, address: Address, block_hash: B256) -> Result<Vec<RawLog>>;

    async fn latest_height(&self) -> Result<u64>;
}

/// A [SourceClient] talking to a node over a websocket, which is required to support head subscriptions.
pub struct WsSourceClient<P> {
    ws_url: String,
    provider: P,
    rpc_timeout: Duration,
}

/// Connect to the websocket endpoint at `ws_url`.
pub async fn connect(ws_url: &str, rpc_timeout: Duration) -> Result<Arc<dyn SourceClient>> {
    info!(ws_url, "connecting to source chain");
    let provider = ProviderBuilder::default()
        .on_ws(WsConnect::new(ws_url))
        .await?;
    Ok(Arc::new(WsSourceClient {
        ws_url: ws_url.to_owned(),
        provider,
        rpc_timeout,
    }))
}

impl<P> WsSourceClient<P> {
    async fn timed<T, E>(&self, call: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        timed(&self.ws_url, self.rpc_timeout, call).await
    }
}

fn raw_log(log: Log) -> Result<RawLog> {
    Ok(RawLog {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log
            .block_number
            .ok_or_else(|| anyhow!("log without a block number"))?,
        tx_hash: log
            .transaction_hash
            .ok_or_else(|| anyhow!("log without a transaction hash"))?,
        log_index: log
            .log_index
            .ok_or_else(|| anyhow!("log without a log index"))?,
    })
}

#[async_trait]
impl<P: Provider + 'static> SourceClient for WsSourceClient<P> {
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, BlockHead>> {
        let subscription = self
            .timed(self.provider.subscribe_blocks().into_future())
            .await?;
        Ok(subscription
            .into_stream()
            .map(|header| BlockHead {
                number: header.inner.number,
                hash: header.hash,
                logs_bloom: header.inner.logs_bloom,
            })
            .boxed())
    }

    async fn warp_logs_in_range(
        &self,
        address: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(warp_topic())
            .from_block(from)
            .to_block(to);
        self.timed(self.provider.get_logs(&filter))
            .await?
            .into_iter()
            .map(raw_log)
            .collect()
    }

    async fn warp_logs_in_block(&self, address: Address, block_hash: B256) -> Result<Vec<RawLog>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(warp_topic())
            .at_block_hash(block_hash);
        self.timed(self.provider.get_logs(&filter))
            .await?
            .into_iter()
            .map(raw_log)
            .collect()
    }

    async fn latest_height(&self) -> Result<u64> {
        self.timed(self.provider.get_block_number()).await
    }
}
