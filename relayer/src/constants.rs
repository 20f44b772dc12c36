use std::time::Duration;

use alloy::primitives::{Address, address};

// Address of the warp messenger precompile, which emits `SendWarpMessage` logs on every source chain
pub const WARP_PRECOMPILE_ADDRESS: Address = address!("0200000000000000000000000000000000000005");

// Maximum number of blocks covered by a single `eth_getLogs` request during catchup
pub const MAX_BLOCKS_PER_REQUEST: u64 = 200;

// Number of catchup chunks whose logs may be fetched at the same time
pub const MAX_CONCURRENT_CATCHUP_REQUESTS: usize = 4;

// Capacity of the queue between the header converter and the listener
pub const MAX_PENDING_BLOCKS: usize = 20_000;

// Default deadline for a single outbound RPC call
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

// Bound on the retries of one catchup chunk (or one live block's logs)
pub const LOG_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// Bound on the single resubscription attempt made after a subscription is lost
pub const RESUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(20);

// Backoff applied between retries of a failing RPC call
pub const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(200);
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

// Maximum number of subnets whose validators are tracked by the app request network
pub const MAX_TRACKED_SUBNETS: usize = 16;

// Number of historical P-Chain heights whose validator sets are cached
pub const VALIDATOR_SET_CACHE_SIZE: usize = 64;

// Maximum number of unconfirmed transactions per signing key
pub const SIGNER_CAPACITY: usize = 16;

// Multiplier applied to the base fee estimate when no maximum base fee is configured
pub const BASE_FEE_FACTOR: u128 = 3;

// Extra time a `send_tx` caller waits on top of the signer's inclusion timeout, covering the
// final receipt lookup and the hand-off back to the caller
pub const RPC_MARGIN: Duration = Duration::from_secs(2 * DEFAULT_RPC_TIMEOUT.as_secs());

// Default quorum, expressed as a percentage of total stake
pub const DEFAULT_QUORUM_NUMERATOR: u64 = 67;
pub const QUORUM_DENOMINATOR: u64 = 100;
