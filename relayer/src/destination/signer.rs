//! A signing key that issues transactions with its own nonce sequence and a bounded number of unconfirmed
//! transactions.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope},
    eips::{eip2718::Encodable2718, eip2930::AccessList},
    primitives::{Address, Bytes, TxHash, TxKind, U256},
    signers::{SignerSync, local::PrivateKeySigner},
};
use anyhow::{Result, anyhow};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::*;

use super::{
    fees::{FeeConfig, fetch_fees},
    rpc::{DeliveryReceipt, DestinationRpc},
};
use crate::{error::SendTxError, retry::with_retries};

/// A transaction waiting to be issued by a signer. Exactly one result is sent on `result` for every [TxData] a
/// signer receives.
#[derive(Debug)]
pub struct TxData {
    pub to: Address,
    pub gas_limit: u64,
    pub call_data: Bytes,
    pub access_list: AccessList,
    pub result: oneshot::Sender<Result<DeliveryReceipt, SendTxError>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SignerConfig {
    pub chain_id: u64,
    pub fees: FeeConfig,
    /// How long to wait for a submitted transaction to be included.
    pub tx_inclusion_timeout: Duration,
    /// Maximum number of submitted transactions without a receipt.
    pub capacity: usize,
}

/// Claimed by a caller to hand a [TxData] to a signer. A signer only offers a ticket while it holds a free slot
/// and is waiting for work, so a claimed ticket means the transaction is issued immediately.
pub(crate) type Ticket = oneshot::Sender<TxData>;

/// The sending side of a running [ConcurrentSigner].
#[derive(Debug, Clone)]
pub struct SignerHandle {
    address: Address,
    tickets: Arc<Mutex<mpsc::Receiver<Ticket>>>,
    in_flight: Arc<AtomicUsize>,
}

impl SignerHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// The number of submitted transactions which are still waiting for a receipt.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until the signer has a free slot and is ready for work. Returns `None` once the signer has stopped.
    ///
    /// Cancel safe: a ticket is only taken from the signer when this resolves.
    pub(crate) async fn claim(&self) -> Option<Ticket> {
        self.tickets.lock().await.recv().await
    }
}

/// One unit of a signer's in-flight capacity, held from submission until the transaction's receipt is received or
/// waiting for it is abandoned. Dropping it releases the capacity.
struct InFlightSlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl InFlightSlot {
    fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightSlot {
            _permit: permit,
            in_flight,
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ConcurrentSigner {
    signer: PrivateKeySigner,
    rpc: Arc<dyn DestinationRpc>,
    config: SignerConfig,
    /// The nonce of the next transaction. Only this signer sends transactions from its address.
    nonce: u64,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    tickets: mpsc::Sender<Ticket>,
}

impl ConcurrentSigner {
    /// Create a signer, starting from the pending nonce of its address.
    pub async fn new(
        signer: PrivateKeySigner,
        rpc: Arc<dyn DestinationRpc>,
        config: SignerConfig,
    ) -> Result<(ConcurrentSigner, SignerHandle)> {
        let address = signer.address();
        let nonce = rpc.pending_nonce(address).await?;
        info!(%address, nonce, "initialised signer");

        let capacity = config.capacity.max(1);
        // At most one outstanding ticket, offered while the signer waits for work.
        let (tickets, ticket_receiver) = mpsc::channel(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let handle = SignerHandle {
            address,
            tickets: Arc::new(Mutex::new(ticket_receiver)),
            in_flight: in_flight.clone(),
        };
        let signer = ConcurrentSigner {
            signer,
            rpc,
            config: SignerConfig { capacity, ..config },
            nonce,
            slots: Arc::new(Semaphore::new(capacity)),
            in_flight,
            tickets,
        };
        Ok((signer, handle))
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Issue transactions until every [SignerHandle] has been dropped.
    pub async fn run(mut self) {
        loop {
            let Ok(permit) = self.slots.clone().acquire_owned().await else {
                return;
            };
            let (ticket, work) = oneshot::channel();
            if self.tickets.send(ticket).await.is_err() {
                debug!(address = %self.address(), "all handles dropped, stopping signer");
                return;
            }
            match work.await {
                Ok(tx) => self.issue_transaction(tx, permit).await,
                // The caller gave up after claiming the ticket. The slot is offered again.
                Err(_) => trace!(address = %self.address(), "ticket abandoned"),
            }
        }
    }

    /// Sign and submit `tx`. On success, confirmation continues in the background and this returns immediately.
    async fn issue_transaction(&mut self, tx: TxData, permit: OwnedSemaphorePermit) {
        let slot = InFlightSlot::new(permit, self.in_flight.clone());
        let sender = self.address();
        let nonce = self.nonce;

        let fees = match fetch_fees(self.rpc.as_ref(), &self.config.fees).await {
            Ok(fees) => fees,
            Err(error) => {
                warn!(%sender, nonce, "failed to fetch fees: {error:#}");
                let _ = tx.result.send(Err(SendTxError::Submit {
                    sender,
                    nonce,
                    error,
                }));
                return;
            }
        };

        let unsigned = TxEip1559 {
            chain_id: self.config.chain_id,
            nonce,
            gas_limit: tx.gas_limit,
            max_fee_per_gas: fees.gas_fee_cap,
            max_priority_fee_per_gas: fees.gas_tip_cap,
            to: TxKind::Call(tx.to),
            value: U256::ZERO,
            access_list: tx.access_list,
            input: tx.call_data,
        };
        let signature = match self.signer.sign_hash_sync(&unsigned.signature_hash()) {
            Ok(signature) => signature,
            Err(error) => {
                let _ = tx.result.send(Err(SendTxError::Signing {
                    sender,
                    nonce,
                    error: error.into(),
                }));
                return;
            }
        };
        let signed = TxEnvelope::from(unsigned.into_signed(signature));
        let encoded: Bytes = signed.encoded_2718().into();

        let tx_hash = match self.rpc.send_raw_transaction(encoded).await {
            Ok(tx_hash) => tx_hash,
            Err(error) => {
                warn!(%sender, nonce, "failed to submit transaction: {error:#}");
                // The slot is released here and the nonce is reused by the next transaction.
                drop(slot);
                let _ = tx.result.send(Err(SendTxError::Submit {
                    sender,
                    nonce,
                    error,
                }));
                return;
            }
        };
        self.nonce += 1;
        info!(%sender, nonce, %tx_hash, "submitted transaction");

        tokio::spawn(wait_for_receipt(
            self.rpc.clone(),
            tx_hash,
            self.config.tx_inclusion_timeout,
            slot,
            tx.result,
        ));
    }
}

async fn wait_for_receipt(
    rpc: Arc<dyn DestinationRpc>,
    tx_hash: TxHash,
    timeout: Duration,
    slot: InFlightSlot,
    result: oneshot::Sender<Result<DeliveryReceipt, SendTxError>>,
) {
    let receipt = with_retries("fetch receipt", timeout, || async {
        rpc.transaction_receipt(tx_hash)
            .await?
            .ok_or_else(|| anyhow!("transaction {tx_hash} not yet included"))
    })
    .await;
    drop(slot);

    let receipt = match receipt {
        Ok(receipt) => {
            if !receipt.success {
                warn!(%tx_hash, block = receipt.block_number, "transaction reverted");
            } else {
                debug!(%tx_hash, block = receipt.block_number, "transaction included");
            }
            Ok(receipt)
        }
        Err(e) => {
            warn!(%tx_hash, "gave up waiting for receipt: {e:#}");
            Err(SendTxError::ReceiptTimeout { tx_hash, timeout })
        }
    };
    let _ = result.send(receipt);
}
