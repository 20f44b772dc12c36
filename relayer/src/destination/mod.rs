//! Delivery of signed warp messages to a destination chain.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::{
    eips::eip2930::{AccessList, AccessListItem},
    primitives::{Address, B256, Bytes},
    signers::local::PrivateKeySigner,
};
use anyhow::Result;
use futures::future::select_all;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::*;

use crate::{
    constants::{RPC_MARGIN, SIGNER_CAPACITY, WARP_PRECOMPILE_ADDRESS},
    crypto::Id,
    epoch::EpochResolver,
    error::SendTxError,
    health::HealthTracker,
    validators::PChainHeight,
};

pub mod fees;
pub mod rpc;
pub mod signer;

use fees::FeeConfig;
use rpc::{DeliveryReceipt, DestinationRpc};
use signer::{ConcurrentSigner, SignerConfig, SignerHandle, TxData};

/// Marks the end of a predicate, before it is padded to a whole number of storage keys.
const PREDICATE_END_DELIMITER: u8 = 0xff;

/// Encode a signed warp message as the predicate the warp precompile reads from a transaction's access list.
///
/// The message is followed by a delimiter byte and zero-padded to a multiple of 32 bytes, then split into storage
/// keys of the precompile's address. An empty message produces an empty access list.
pub fn warp_predicate_access_list(signed_message: &[u8]) -> AccessList {
    if signed_message.is_empty() {
        return AccessList::default();
    }
    let mut predicate = Vec::with_capacity(signed_message.len() + 32);
    predicate.extend_from_slice(signed_message);
    predicate.push(PREDICATE_END_DELIMITER);
    predicate.resize(predicate.len().div_ceil(32) * 32, 0);

    AccessList(vec![AccessListItem {
        address: WARP_PRECOMPILE_ADDRESS,
        storage_keys: predicate.chunks_exact(32).map(B256::from_slice).collect(),
    }])
}

/// Settings shared by every signer of one destination chain.
#[derive(Debug, Clone, Copy)]
pub struct DestinationSettings {
    pub fees: FeeConfig,
    /// How long signers wait for a transaction to be included. Callers of [DestinationClient::send_tx] wait for
    /// this plus [RPC_MARGIN].
    pub tx_inclusion_timeout: Duration,
}

pub struct DestinationClient {
    blockchain_id: Id,
    signers: Vec<SignerHandle>,
    signer_tasks: Vec<JoinHandle<()>>,
    health: Arc<HealthTracker>,
    tx_inclusion_timeout: Duration,
    epochs: Option<EpochResolver>,
    sent_transactions: Counter<u64>,
    send_duration: Histogram<f64>,
}

impl DestinationClient {
    /// Start a [ConcurrentSigner] for each of `keys`. The chain is marked unhealthy in `health` if any of them stops.
    pub async fn new(
        blockchain_id: Id,
        rpc: Arc<dyn DestinationRpc>,
        keys: Vec<PrivateKeySigner>,
        settings: DestinationSettings,
        epochs: Option<EpochResolver>,
        health: Arc<HealthTracker>,
    ) -> Result<Self> {
        let chain_id = rpc.chain_id().await?;
        let config = SignerConfig {
            chain_id,
            fees: settings.fees,
            tx_inclusion_timeout: settings.tx_inclusion_timeout,
            capacity: SIGNER_CAPACITY,
        };

        health.register(blockchain_id);
        let mut signers = Vec::with_capacity(keys.len());
        let mut signer_tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let (signer, handle) = ConcurrentSigner::new(key, rpc.clone(), config).await?;
            let exit = SignerExit {
                blockchain_id,
                address: handle.address(),
                health: health.clone(),
            };
            signer_tasks.push(tokio::spawn(async move {
                let _exit = exit;
                signer.run().await;
            }));
            signers.push(handle);
        }
        info!(%blockchain_id, chain_id, signers = signers.len(), "started destination client");

        let meter = opentelemetry::global::meter("icm-relayer");
        let sent_transactions = meter
            .u64_counter("relayer.destination.transactions")
            .with_description("Transactions handed to destination chain signers")
            .build();
        let send_duration = meter
            .f64_histogram("relayer.destination.send_duration")
            .with_unit("s")
            .with_boundaries(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0])
            .build();

        Ok(DestinationClient {
            blockchain_id,
            signers,
            signer_tasks,
            health,
            tx_inclusion_timeout: settings.tx_inclusion_timeout,
            epochs,
            sent_transactions,
            send_duration,
        })
    }

    pub fn blockchain_id(&self) -> Id {
        self.blockchain_id
    }

    pub fn signer_addresses(&self) -> Vec<Address> {
        self.signers.iter().map(|s| s.address()).collect()
    }

    /// Transactions submitted by any signer which are still waiting for a receipt.
    pub fn in_flight(&self) -> usize {
        self.signers.iter().map(|s| s.in_flight()).sum()
    }

    /// Deliver `signed_message` to `to` and wait for the transaction's receipt.
    ///
    /// The transaction is issued by whichever signer in `allowed_signers` (or any signer if `None`) has a free slot
    /// first. The wait for a receipt is bounded from the moment a signer takes the transaction. Waiting for a free
    /// slot is not.
    pub async fn send_tx(
        &self,
        signed_message: &[u8],
        allowed_signers: Option<&HashSet<Address>>,
        to: Address,
        gas_limit: u64,
        call_data: Bytes,
    ) -> Result<DeliveryReceipt, SendTxError> {
        let start = Instant::now();
        let result = self
            .send_tx_inner(signed_message, allowed_signers, to, gas_limit, call_data)
            .await;

        let outcome = match &result {
            Ok(receipt) if receipt.success => "included",
            Ok(_) => "reverted",
            Err(SendTxError::NoEligibleSigner | SendTxError::SignerClosed) => "no-signer",
            Err(SendTxError::ReceiptTimeout { .. } | SendTxError::CallerTimeout(_)) => "timeout",
            Err(_) => "failed",
        };
        let attributes = [
            KeyValue::new("blockchain_id", self.blockchain_id.to_string()),
            KeyValue::new("outcome", outcome),
        ];
        self.sent_transactions.add(1, &attributes);
        self.send_duration
            .record(start.elapsed().as_secs_f64(), &attributes);
        result
    }

    async fn send_tx_inner(
        &self,
        signed_message: &[u8],
        allowed_signers: Option<&HashSet<Address>>,
        to: Address,
        gas_limit: u64,
        call_data: Bytes,
    ) -> Result<DeliveryReceipt, SendTxError> {
        let mut candidates: Vec<&SignerHandle> = self
            .signers
            .iter()
            .filter(|s| allowed_signers.is_none_or(|allowed| allowed.contains(&s.address())))
            .collect();
        if candidates.is_empty() {
            return Err(SendTxError::NoEligibleSigner);
        }

        let (result_sender, result) = oneshot::channel();
        let mut tx = TxData {
            to,
            gas_limit,
            call_data,
            access_list: warp_predicate_access_list(signed_message),
            result: result_sender,
        };

        let sender = loop {
            if candidates.is_empty() {
                warn!(blockchain_id = %self.blockchain_id, "no eligible signer is running");
                self.health.mark_unhealthy(self.blockchain_id);
                return Err(SendTxError::SignerClosed);
            }
            let (claimed, index, _) = select_all(candidates.iter().map(|s| {
                let s: &SignerHandle = *s;
                Box::pin(s.claim())
            }))
            .await;
            let handed_off = match claimed {
                Some(ticket) => ticket.send(tx),
                None => Err(tx),
            };
            match handed_off {
                Ok(()) => break candidates[index].address(),
                Err(returned) => {
                    warn!(signer = %candidates[index].address(), "signer has shut down");
                    tx = returned;
                    candidates.swap_remove(index);
                }
            }
        };
        debug!(%sender, %to, "handed transaction to signer");

        let timeout = self.tx_inclusion_timeout + RPC_MARGIN;
        match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendTxError::ResultDropped { sender }),
            Err(_) => Err(SendTxError::CallerTimeout(timeout)),
        }
    }

    /// The P-Chain height whose validators should sign messages for this chain.
    pub async fn p_chain_height_for_signing(&self) -> Result<PChainHeight> {
        match &self.epochs {
            Some(epochs) => epochs.p_chain_height().await,
            None => Ok(PChainHeight::Current),
        }
    }
}

/// Marks the destination unhealthy when a signer task ends, whether it returned, panicked or was aborted.
struct SignerExit {
    blockchain_id: Id,
    address: Address,
    health: Arc<HealthTracker>,
}

impl Drop for SignerExit {
    fn drop(&mut self) {
        warn!(blockchain_id = %self.blockchain_id, signer = %self.address, "signer stopped");
        self.health.mark_unhealthy(self.blockchain_id);
    }
}

impl Drop for DestinationClient {
    fn drop(&mut self) {
        for task in &self.signer_tasks {
            task.abort();
        }
    }
}
