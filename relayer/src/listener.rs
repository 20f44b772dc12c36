//! Drives a [Subscriber] for one source chain, sequencing catchup alongside live blocks and recovering from lost
//! subscriptions.

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use opentelemetry::{KeyValue, metrics::Counter};
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::*;

use crate::{
    constants::RESUBSCRIBE_TIMEOUT,
    crypto::Id,
    error::SubscriberError,
    health::HealthTracker,
    message::WarpBlockInfo,
    source::SourceClient,
    subscriber::{Subscriber, SubscriberOutputs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Opening the initial subscription.
    Starting,
    /// Live blocks are flowing and at least one catchup range is still being replayed.
    Catchup,
    Live,
    /// The subscription was lost and a single resubscription is in progress.
    Reconnecting,
    /// The listener has stopped and will not produce any more blocks.
    Terminal,
}

pub struct Listener {
    blockchain_id: Id,
    subscriber: Subscriber,
    outputs: SubscriberOutputs,
    /// First height to replay if nothing has been processed yet. `None` means only live blocks are relayed.
    start_height: Option<u64>,
    /// Highest live height forwarded to the sink.
    last_processed: Option<u64>,
    /// Set on startup and after every reconnection. The next live block triggers a catchup of the gap before it.
    needs_catchup: bool,
    catchups: JoinSet<Result<(), SubscriberError>>,
    initial_connection_timeout: Duration,
    sink: mpsc::Sender<WarpBlockInfo>,
    health: Arc<HealthTracker>,
    state: watch::Sender<ListenerState>,
    processed_blocks: Counter<u64>,
}

impl Listener {
    pub fn new(
        blockchain_id: Id,
        client: Arc<dyn SourceClient>,
        warp_address: Address,
        start_height: Option<u64>,
        initial_connection_timeout: Duration,
        sink: mpsc::Sender<WarpBlockInfo>,
        health: Arc<HealthTracker>,
    ) -> Listener {
        let (subscriber, outputs) = Subscriber::new(blockchain_id, client, warp_address);
        let (state, _) = watch::channel(ListenerState::Starting);
        let meter = opentelemetry::global::meter("icm-relayer");
        let processed_blocks = meter
            .u64_counter("relayer.listener.blocks")
            .with_description("Warp blocks forwarded by source chain listeners")
            .build();
        health.register(blockchain_id);

        Listener {
            blockchain_id,
            subscriber,
            outputs,
            start_height,
            last_processed: None,
            needs_catchup: start_height.is_some(),
            catchups: JoinSet::new(),
            initial_connection_timeout,
            sink,
            health,
            state,
            processed_blocks,
        }
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    /// Relay blocks until `shutdown` is set or an unrecoverable error occurs.
    ///
    /// Shutting down is not an error. The chain is marked unhealthy whenever this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(blockchain_id = %self.blockchain_id, start_height = ?self.start_height, "starting listener");
        let subscribed = select! {
            subscribed = self.subscriber.subscribe(self.initial_connection_timeout) => subscribed,
            () = shutdown_requested(&mut shutdown) => {
                info!(blockchain_id = %self.blockchain_id, "listener cancelled while subscribing");
                self.stop();
                return Ok(());
            }
        };
        if let Err(e) = subscribed {
            return Err(self.terminate(e.into()));
        }
        self.set_state(if self.needs_catchup {
            ListenerState::Catchup
        } else {
            ListenerState::Live
        });

        loop {
            select! {
                // Blocks converted before a subscription was lost are always forwarded before the loss is handled.
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(blockchain_id = %self.blockchain_id, "listener cancelled");
                        self.stop();
                        return Ok(());
                    }
                }
                Some(block) = self.outputs.blocks.recv() => {
                    if let Err(e) = self.handle_block(block).await {
                        return Err(self.terminate(e));
                    }
                }
                Some(error) = self.outputs.fatal_errors.recv() => {
                    return Err(self.terminate(error.into()));
                }
                Some(error) = self.outputs.subscription_errors.recv() => {
                    select! {
                        reconnected = self.reconnect(error) => reconnected?,
                        () = shutdown_requested(&mut shutdown) => {
                            info!(blockchain_id = %self.blockchain_id, "listener cancelled while resubscribing");
                            self.stop();
                            return Ok(());
                        }
                    }
                }
                Some(result) = self.catchups.join_next(), if !self.catchups.is_empty() => {
                    match result {
                        Ok(Ok(())) => {
                            if self.catchups.is_empty() && *self.state.borrow() == ListenerState::Catchup {
                                self.set_state(ListenerState::Live);
                            }
                        }
                        Ok(Err(e)) => return Err(self.terminate(e.into())),
                        Err(e) => return Err(self.terminate(anyhow!("catchup task failed: {e}"))),
                    }
                }
                else => {
                    return Err(self.terminate(anyhow!("subscriber outputs closed")));
                }
            }
        }
    }

    async fn handle_block(&mut self, block: WarpBlockInfo) -> Result<()> {
        if !block.is_catchup {
            if self.needs_catchup {
                self.needs_catchup = false;
                self.start_catchup(block.block_number);
            }
            if self.last_processed.is_none_or(|last| block.block_number > last) {
                self.last_processed = Some(block.block_number);
            }
        }
        trace!(
            blockchain_id = %self.blockchain_id,
            height = block.block_number,
            messages = block.messages.len(),
            catchup = block.is_catchup,
            "forwarding block"
        );

        self.processed_blocks.add(
            1,
            &[
                KeyValue::new("blockchain_id", self.blockchain_id.to_string()),
                KeyValue::new("catchup", block.is_catchup),
            ],
        );
        self.sink
            .send(block)
            .await
            .map_err(|_| anyhow!("block sink for {} closed", self.blockchain_id))
    }

    /// Replay every height between the last processed block and `first_live_height`.
    fn start_catchup(&mut self, first_live_height: u64) {
        let Some(start) = self
            .last_processed
            .map(|last| last + 1)
            .or(self.start_height)
        else {
            return;
        };
        let Some(end) = first_live_height.checked_sub(1) else {
            return;
        };
        if start > end {
            debug!(blockchain_id = %self.blockchain_id, first_live_height, "no gap to catch up");
            return;
        }
        info!(blockchain_id = %self.blockchain_id, start, end, "catching up");
        self.set_state(ListenerState::Catchup);
        self.catchups
            .spawn(self.subscriber.process_from_height(start, end));
    }

    async fn reconnect(&mut self, error: anyhow::Error) -> Result<()> {
        warn!(blockchain_id = %self.blockchain_id, "subscription lost, resubscribing: {error:#}");
        self.set_state(ListenerState::Reconnecting);
        self.needs_catchup = true;
        match self.subscriber.subscribe(RESUBSCRIBE_TIMEOUT).await {
            Ok(()) => {
                self.health.mark_healthy(self.blockchain_id);
                self.set_state(if self.catchups.is_empty() {
                    ListenerState::Live
                } else {
                    ListenerState::Catchup
                });
                Ok(())
            }
            Err(e) => Err(self.terminate(e.into())),
        }
    }

    fn terminate(&mut self, error: anyhow::Error) -> anyhow::Error {
        error!(blockchain_id = %self.blockchain_id, "listener failed: {error:#}");
        self.stop();
        error
    }

    fn stop(&mut self) {
        self.catchups.abort_all();
        self.health.mark_unhealthy(self.blockchain_id);
        self.set_state(ListenerState::Terminal);
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(blockchain_id = %self.blockchain_id, from = ?*current, to = ?state, "listener state");
            *current = state;
            true
        });
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
