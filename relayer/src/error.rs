use std::time::Duration;

use alloy::primitives::{Address, TxHash};

use crate::{crypto::Id, validators::PChainHeight};

/// Failures surfaced by a [crate::subscriber::Subscriber] to its listener.
#[derive(thiserror::Error, Debug)]
pub enum SubscriberError {
    #[error("failed to subscribe to new heads of {blockchain_id} within {timeout:?}: {error:#}")]
    SubscribeExhausted {
        blockchain_id: Id,
        timeout: Duration,
        error: anyhow::Error,
    },
    #[error("failed to convert header {height} into a warp block: {error:#}")]
    ConversionFailed { height: u64, error: anyhow::Error },
    #[error("failed to fetch warp logs for blocks {from}..={to}: {error:#}")]
    LogFetchFailed {
        from: u64,
        to: u64,
        error: anyhow::Error,
    },
    #[error("the block consumer has gone away")]
    ConsumerClosed,
}

/// The outcome of a failed [crate::destination::DestinationClient::send_tx] call.
#[derive(thiserror::Error, Debug)]
pub enum SendTxError {
    #[error("no configured signer is allowed to send this transaction")]
    NoEligibleSigner,
    #[error("every eligible signer has shut down")]
    SignerClosed,
    #[error("signer {sender} dropped the transaction without a result")]
    ResultDropped { sender: Address },
    #[error("failed to sign transaction from {sender} with nonce {nonce}: {error:#}")]
    Signing {
        sender: Address,
        nonce: u64,
        error: anyhow::Error,
    },
    #[error("failed to submit transaction from {sender} with nonce {nonce}: {error:#}")]
    Submit {
        sender: Address,
        nonce: u64,
        error: anyhow::Error,
    },
    #[error("transaction {tx_hash} was not included within {timeout:?}")]
    ReceiptTimeout { tx_hash: TxHash, timeout: Duration },
    #[error("no result was received within {0:?}")]
    CallerTimeout(Duration),
}

#[derive(thiserror::Error, Debug)]
pub enum ValidatorError {
    #[error("no validator set for subnet {subnet} at P-Chain height {height}")]
    UnknownSubnet { subnet: Id, height: PChainHeight },
    #[error("total validator weight of subnet {0} overflows")]
    WeightOverflow(Id),
    #[error(
        "connected weight {connected} of subnet {subnet} does not meet quorum {numerator}/{denominator} of {total}"
    )]
    InsufficientWeight {
        subnet: Id,
        connected: u64,
        total: u64,
        numerator: u64,
        denominator: u64,
    },
    #[error("failed to fetch validators: {0:#}")]
    Fetch(anyhow::Error),
}
