//! Follows the head of one source chain and replays historical ranges of it, turning both into [WarpBlockInfo]s.
//!
//! Live heads are converted by a dedicated worker and published on a bounded queue. Historical ranges are fetched in
//! chunks of at most [MAX_BLOCKS_PER_REQUEST] blocks and published on the same queue with `is_catchup` set. Every height
//! in a requested range is published exactly once, even if it contains no warp messages.

use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tokio::{
    sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::*;

use crate::{
    constants::{
        LOG_FETCH_TIMEOUT, MAX_BLOCKS_PER_REQUEST, MAX_CONCURRENT_CATCHUP_REQUESTS,
        MAX_PENDING_BLOCKS,
    },
    crypto::Id,
    error::SubscriberError,
    message::{BlockHead, WarpBlockInfo, bloom_may_contain_warp_logs, group_warp_logs},
    retry::with_retries,
    source::SourceClient,
};

/// The receiving ends of a [Subscriber]'s output channels.
pub struct SubscriberOutputs {
    /// Blocks from both the live subscription and catchup.
    pub blocks: Receiver<WarpBlockInfo>,
    /// The live subscription was lost. Recoverable by calling [Subscriber::subscribe] again.
    pub subscription_errors: UnboundedReceiver<anyhow::Error>,
    /// A block could not be converted. Not recoverable by the subscriber.
    pub fatal_errors: UnboundedReceiver<SubscriberError>,
}

struct Shared {
    blockchain_id: Id,
    client: Arc<dyn SourceClient>,
    warp_address: Address,
    blocks: Sender<WarpBlockInfo>,
}

pub struct Subscriber {
    shared: Arc<Shared>,
    subscription_errors: UnboundedSender<anyhow::Error>,
    fatal_errors: UnboundedSender<SubscriberError>,
    /// Converts heads from the current subscription.
    converter: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(
        blockchain_id: Id,
        client: Arc<dyn SourceClient>,
        warp_address: Address,
    ) -> (Self, SubscriberOutputs) {
        let (blocks_sender, blocks) = mpsc::channel(MAX_PENDING_BLOCKS);
        let (subscription_errors_sender, subscription_errors) = mpsc::unbounded_channel();
        let (fatal_errors_sender, fatal_errors) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            shared: Arc::new(Shared {
                blockchain_id,
                client,
                warp_address,
                blocks: blocks_sender,
            }),
            subscription_errors: subscription_errors_sender,
            fatal_errors: fatal_errors_sender,
            converter: None,
        };
        let outputs = SubscriberOutputs {
            blocks,
            subscription_errors,
            fatal_errors,
        };
        (subscriber, outputs)
    }

    pub fn blockchain_id(&self) -> Id {
        self.shared.blockchain_id
    }

    /// Replace any existing head subscription with a new one, retrying for up to `timeout`.
    pub async fn subscribe(&mut self, timeout: Duration) -> Result<(), SubscriberError> {
        if let Some(converter) = self.converter.take() {
            converter.abort();
        }

        let client = self.shared.client.clone();
        let heads = with_retries("subscribe to heads", timeout, || client.subscribe_heads())
            .await
            .map_err(|error| SubscriberError::SubscribeExhausted {
                blockchain_id: self.shared.blockchain_id,
                timeout,
                error,
            })?;
        info!(blockchain_id = %self.shared.blockchain_id, "subscribed to new heads");

        self.converter = Some(tokio::spawn(convert_heads(
            self.shared.clone(),
            heads,
            self.subscription_errors.clone(),
            self.fatal_errors.clone(),
        )));
        Ok(())
    }

    /// Publish a catchup block for every height in `start..=end`.
    ///
    /// The returned future does not borrow the subscriber, so it can be spawned and run concurrently with live
    /// processing. Chunks are fetched concurrently and may complete in any order.
    pub fn process_from_height(
        &self,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<(), SubscriberError>> + Send + 'static {
        let shared = self.shared.clone();
        async move { shared.process_from_height(start, end).await }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(converter) = self.converter.take() {
            converter.abort();
        }
    }
}

/// Split `start..=end` into consecutive inclusive chunks of at most `chunk_size` heights.
pub fn chunk_range(start: u64, end: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut chunks = vec![];
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(chunk_size - 1).min(end);
        chunks.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    chunks
}

impl Shared {
    async fn process_from_height(&self, start: u64, end: u64) -> Result<(), SubscriberError> {
        if start > end {
            return Ok(());
        }
        info!(blockchain_id = %self.blockchain_id, start, end, "processing historical blocks");

        futures::stream::iter(chunk_range(start, end, MAX_BLOCKS_PER_REQUEST).into_iter().map(Ok))
            .try_for_each_concurrent(MAX_CONCURRENT_CATCHUP_REQUESTS, |(from, to)| {
                self.process_chunk(from, to)
            })
            .await?;

        info!(blockchain_id = %self.blockchain_id, start, end, "finished processing historical blocks");
        Ok(())
    }

    async fn process_chunk(&self, from: u64, to: u64) -> Result<(), SubscriberError> {
        let logs = with_retries("fetch warp logs", LOG_FETCH_TIMEOUT, || {
            self.client.warp_logs_in_range(self.warp_address, from, to)
        })
        .await
        .map_err(|error| SubscriberError::LogFetchFailed { from, to, error })?;

        let mut messages = group_warp_logs(&logs, self.warp_address)
            .map_err(|error| SubscriberError::LogFetchFailed { from, to, error })?;
        debug!(from, to, blocks_with_messages = messages.len(), "fetched catchup chunk");

        for height in from..=to {
            let block = match messages.remove(&height) {
                Some(messages) => WarpBlockInfo {
                    block_number: height,
                    messages,
                    is_catchup: true,
                },
                None => WarpBlockInfo::empty(height, true),
            };
            self.blocks
                .send(block)
                .await
                .map_err(|_| SubscriberError::ConsumerClosed)?;
        }
        Ok(())
    }

    async fn warp_block_from_head(&self, head: &BlockHead) -> Result<WarpBlockInfo> {
        if !bloom_may_contain_warp_logs(&head.logs_bloom, self.warp_address) {
            return Ok(WarpBlockInfo::empty(head.number, false));
        }
        let logs = with_retries("fetch block warp logs", LOG_FETCH_TIMEOUT, || {
            self.client.warp_logs_in_block(self.warp_address, head.hash)
        })
        .await?;
        let mut messages = group_warp_logs(&logs, self.warp_address)?;
        if let Some(other) = messages.keys().find(|n| **n != head.number) {
            return Err(anyhow!(
                "logs for block {} ({}) reported block number {other}",
                head.number,
                head.hash
            ));
        }
        Ok(WarpBlockInfo {
            block_number: head.number,
            messages: messages.remove(&head.number).unwrap_or_default(),
            is_catchup: false,
        })
    }
}

async fn convert_heads(
    shared: Arc<Shared>,
    mut heads: BoxStream<'static, BlockHead>,
    subscription_errors: UnboundedSender<anyhow::Error>,
    fatal_errors: UnboundedSender<SubscriberError>,
) {
    while let Some(head) = heads.next().await {
        trace!(height = head.number, hash = %head.hash, "new head");
        match shared.warp_block_from_head(&head).await {
            Ok(block) => {
                if shared.blocks.send(block).await.is_err() {
                    debug!(blockchain_id = %shared.blockchain_id, "block consumer closed, stopping conversion");
                    return;
                }
            }
            Err(error) => {
                error!(blockchain_id = %shared.blockchain_id, height = head.number, "failed to convert head: {error:#}");
                let _ = fatal_errors.send(SubscriberError::ConversionFailed {
                    height: head.number,
                    error,
                });
                return;
            }
        }
    }
    warn!(blockchain_id = %shared.blockchain_id, "head subscription closed");
    let _ = subscription_errors.send(anyhow!(
        "head subscription for {} closed",
        shared.blockchain_id
    ));
}
