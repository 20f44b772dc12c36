use std::{collections::HashSet, fs, path::Path, str::FromStr, time::Duration};

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    constants::{
        DEFAULT_QUORUM_NUMERATOR, DEFAULT_RPC_TIMEOUT, QUORUM_DENOMINATOR, WARP_PRECOMPILE_ADDRESS,
    },
    crypto::Id,
    destination::fees::FeeConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The node serving the P-Chain API, used to read validator sets.
    pub p_chain_api: ApiConfig,
    /// The node serving the Info API, whose peers are the validators we consider ourselves connected to.
    pub info_api: ApiConfig,
    /// Chains to relay messages from.
    pub source_blockchains: Vec<SourceBlockchain>,
    /// Chains to deliver messages to.
    pub destination_blockchains: Vec<DestinationBlockchain>,
    /// How long a signer waits for a transaction to be included before giving up on it. Callers sending a
    /// transaction wait slightly longer than this. Defaults to 30 seconds.
    #[serde(default = "tx_inclusion_timeout_default")]
    pub tx_inclusion_timeout: Duration,
    /// How often validator sets and the validators of tracked subnets are refreshed. Defaults to 5 seconds.
    #[serde(default = "validator_refresh_interval_default")]
    pub validator_refresh_interval: Duration,
    /// Bound on retries while establishing the initial connection to each source chain. Defaults to 60 seconds.
    #[serde(default = "initial_connection_timeout_default")]
    pub initial_connection_timeout: Duration,
    /// Percentage of stake which must be connected for a subnet to be considered healthy. Defaults to 67.
    #[serde(default = "quorum_numerator_default")]
    pub quorum_numerator: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Base URL of the node, without the API path. For example, `http://127.0.0.1:9650`.
    pub base_url: String,
    #[serde(default = "rpc_timeout_default")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceBlockchain {
    pub blockchain_id: Id,
    pub subnet_id: Id,
    /// Websocket endpoint of the chain. Must support `eth_subscribe`.
    pub ws_url: String,
    /// Contract whose `SendWarpMessage` logs are relayed. Defaults to the warp precompile.
    #[serde(default = "warp_address_default")]
    pub warp_address: Address,
    /// First height to process. If not set, only blocks produced after startup are relayed.
    #[serde(default)]
    pub start_height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationBlockchain {
    pub blockchain_id: Id,
    pub subnet_id: Id,
    /// HTTP JSON-RPC endpoint of the chain.
    pub rpc_url: String,
    /// Hex encoded private keys. Each key gets its own nonce sequence.
    pub signing_keys: Vec<String>,
    /// Maximum base fee in wei. If not set, a multiple of the current base fee estimate is used.
    #[serde(default)]
    pub max_base_fee: Option<u64>,
    /// Added to the node's suggested priority fee, in wei. Defaults to 1 gwei.
    #[serde(default = "suggested_priority_fee_buffer_default")]
    pub suggested_priority_fee_buffer: u64,
    /// Upper bound on the priority fee, in wei. Defaults to 10 gwei.
    #[serde(default = "max_priority_fee_default")]
    pub max_priority_fee: u64,
    /// ProposerVM API of the chain, which reports the epoch used to select validators. If not set, messages are
    /// signed by the current validator set.
    #[serde(default)]
    pub epoch_api_url: Option<String>,
    #[serde(default = "epoch_duration_default")]
    pub epoch_duration: Duration,
}

impl DestinationBlockchain {
    pub fn signers(&self) -> Result<Vec<PrivateKeySigner>> {
        self.signing_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                PrivateKeySigner::from_str(key.trim_start_matches("0x")).with_context(|| {
                    format!(
                        "signing key {i} of destination {} is invalid",
                        self.blockchain_id
                    )
                })
            })
            .collect()
    }

    pub fn fee_config(&self) -> FeeConfig {
        FeeConfig {
            max_base_fee: self.max_base_fee.map(u128::from),
            suggested_priority_fee_buffer: u128::from(self.suggested_priority_fee_buffer),
            max_priority_fee: u128::from(self.max_priority_fee),
        }
    }
}

fn check_url(url: &str, schemes: &[&str], what: &str) -> Result<()> {
    let parsed = Url::parse(url).with_context(|| format!("{what} {url} is not a valid URL"))?;
    ensure!(
        schemes.contains(&parsed.scheme()),
        "{what} {url} must use one of the schemes {schemes:?}"
    );
    Ok(())
}

impl Config {
    /// Reject configurations the relayer cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.source_blockchains.is_empty(),
            "at least one source blockchain must be configured"
        );
        ensure!(
            !self.destination_blockchains.is_empty(),
            "at least one destination blockchain must be configured"
        );
        ensure!(
            (1..=QUORUM_DENOMINATOR).contains(&self.quorum_numerator),
            "quorum_numerator must be between 1 and {QUORUM_DENOMINATOR}"
        );
        ensure!(
            !self.validator_refresh_interval.is_zero(),
            "validator_refresh_interval must be non-zero"
        );
        check_url(&self.p_chain_api.base_url, &["http", "https"], "P-Chain API")?;
        check_url(&self.info_api.base_url, &["http", "https"], "Info API")?;

        let mut seen = HashSet::new();
        for source in &self.source_blockchains {
            ensure!(
                seen.insert(source.blockchain_id),
                "source blockchain {} is configured more than once",
                source.blockchain_id
            );
            check_url(&source.ws_url, &["ws", "wss"], "source ws_url")?;
        }

        let mut seen = HashSet::new();
        for destination in &self.destination_blockchains {
            let id = destination.blockchain_id;
            ensure!(
                seen.insert(id),
                "destination blockchain {id} is configured more than once"
            );
            check_url(&destination.rpc_url, &["http", "https"], "destination rpc_url")?;
            if let Some(epoch_api_url) = &destination.epoch_api_url {
                check_url(epoch_api_url, &["http", "https"], "destination epoch_api_url")?;
            }
            ensure!(
                !destination.signing_keys.is_empty(),
                "destination {id} has no signing keys"
            );
            destination.signers()?;
            ensure!(
                destination.max_priority_fee > 0,
                "destination {id} must allow a non-zero priority fee"
            );
        }
        Ok(())
    }
}

/// Read and validate the configuration from one or more TOML files. A top-level key may only appear in one file.
pub fn read_config(paths: &[impl AsRef<Path>]) -> Result<Config> {
    let mut merged = toml::Table::new();
    for path in paths {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let table: toml::Table = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        if let Some(key) = table.keys().find(|key| merged.contains_key(*key)) {
            return Err(anyhow!(
                "configuration conflict: {} contained a key {key:?} that was already included in an earlier file",
                path.display()
            ));
        }
        merged.extend(table);
    }

    let config: Config = Config::deserialize(merged)?;
    config.validate()?;
    Ok(config)
}

pub fn tx_inclusion_timeout_default() -> Duration {
    Duration::from_secs(30)
}

pub fn validator_refresh_interval_default() -> Duration {
    Duration::from_secs(5)
}

pub fn initial_connection_timeout_default() -> Duration {
    Duration::from_secs(60)
}

pub fn quorum_numerator_default() -> u64 {
    DEFAULT_QUORUM_NUMERATOR
}

pub fn rpc_timeout_default() -> Duration {
    DEFAULT_RPC_TIMEOUT
}

pub fn warp_address_default() -> Address {
    WARP_PRECOMPILE_ADDRESS
}

pub fn suggested_priority_fee_buffer_default() -> u64 {
    1_000_000_000
}

pub fn max_priority_fee_default() -> u64 {
    10_000_000_000
}

pub fn epoch_duration_default() -> Duration {
    Duration::from_secs(30)
}
