//! Warp messages as observed on a source chain, and the per-block groups in which they are handed to the message
//! coordinator.

use std::collections::BTreeMap;

use alloy::{
    primitives::{Address, B256, Bloom, BloomInput, Bytes, TxHash},
    sol,
    sol_types::SolEvent,
};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

sol! {
    event SendWarpMessage(address indexed sourceAddress, bytes32 indexed unsignedMessageID, bytes message);
}

/// A log as returned by a source chain, reduced to the fields the relayer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub log_index: u64,
}

/// The head of a newly produced source chain block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub hash: B256,
    pub logs_bloom: Bloom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpMessageInfo {
    pub source_address: Address,
    pub unsigned_message_id: B256,
    pub unsigned_message: Bytes,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub block_number: u64,
}

impl WarpMessageInfo {
    pub fn try_from_log(log: &RawLog) -> Result<Self> {
        let decoded = SendWarpMessage::decode_raw_log(log.topics.iter().copied(), &log.data, true)
            .map_err(|e| {
                anyhow!(
                    "invalid SendWarpMessage log {} in transaction {}: {e}",
                    log.log_index,
                    log.tx_hash
                )
            })?;
        Ok(WarpMessageInfo {
            source_address: decoded.sourceAddress,
            unsigned_message_id: decoded.unsignedMessageID,
            unsigned_message: decoded.message,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            block_number: log.block_number,
        })
    }
}

/// All warp messages emitted in one source chain block.
///
/// Exactly one of these is produced for every height the relayer processes, either by the live header converter or by
/// catchup. Blocks produced by catchup have `is_catchup` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpBlockInfo {
    pub block_number: u64,
    pub messages: Vec<WarpMessageInfo>,
    pub is_catchup: bool,
}

impl WarpBlockInfo {
    pub fn empty(block_number: u64, is_catchup: bool) -> Self {
        WarpBlockInfo {
            block_number,
            messages: vec![],
            is_catchup,
        }
    }
}

/// The event signature every warp log carries as its first topic.
pub fn warp_topic() -> B256 {
    SendWarpMessage::SIGNATURE_HASH
}

/// Whether a block with this bloom may contain a warp log emitted by `address`. False positives are possible, false
/// negatives are not.
pub fn bloom_may_contain_warp_logs(bloom: &Bloom, address: Address) -> bool {
    bloom.contains_input(BloomInput::Raw(address.as_slice()))
        && bloom.contains_input(BloomInput::Raw(warp_topic().as_slice()))
}

/// Decode `logs` and group them by block number, each group ordered by log index. Logs which are not warp messages
/// from `address` are ignored.
pub fn group_warp_logs(
    logs: &[RawLog],
    address: Address,
) -> Result<BTreeMap<u64, Vec<WarpMessageInfo>>> {
    let mut blocks: BTreeMap<u64, Vec<WarpMessageInfo>> = BTreeMap::new();
    for log in logs
        .iter()
        .filter(|l| l.address == address && l.topics.first() == Some(&warp_topic()))
    {
        blocks
            .entry(log.block_number)
            .or_default()
            .push(WarpMessageInfo::try_from_log(log)?);
    }
    for messages in blocks.values_mut() {
        messages.sort_by_key(|m| m.log_index);
    }
    Ok(blocks)
}
