use anyhow::Result;
use tracing::trace;

use super::rpc::DestinationRpc;
use crate::constants::BASE_FEE_FACTOR;

/// Fee settings of one destination chain, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeConfig {
    /// Used as-is when set. Otherwise the current base fee estimate is multiplied by [BASE_FEE_FACTOR].
    pub max_base_fee: Option<u128>,
    pub suggested_priority_fee_buffer: u128,
    pub max_priority_fee: u128,
}

/// The EIP-1559 fee fields of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fees {
    pub max_base_fee: u128,
    pub gas_tip_cap: u128,
    pub gas_fee_cap: u128,
}

pub fn compute_fees(config: &FeeConfig, base_fee_estimate: u128, suggested_tip: u128) -> Fees {
    let max_base_fee = config
        .max_base_fee
        .unwrap_or_else(|| base_fee_estimate.saturating_mul(BASE_FEE_FACTOR));
    let gas_tip_cap = suggested_tip
        .saturating_add(config.suggested_priority_fee_buffer)
        .min(config.max_priority_fee);
    Fees {
        max_base_fee,
        gas_tip_cap,
        gas_fee_cap: max_base_fee.saturating_add(gas_tip_cap),
    }
}

/// Fetch the current fee market from `rpc` and derive the fees for a new transaction.
pub async fn fetch_fees(rpc: &dyn DestinationRpc, config: &FeeConfig) -> Result<Fees> {
    let base_fee_estimate = match config.max_base_fee {
        Some(_) => 0,
        None => rpc.estimate_base_fee().await?,
    };
    let suggested_tip = rpc.suggest_gas_tip_cap().await?;
    let fees = compute_fees(config, base_fee_estimate, suggested_tip);
    trace!(base_fee_estimate, suggested_tip, ?fees, "computed fees");
    Ok(fees)
}
