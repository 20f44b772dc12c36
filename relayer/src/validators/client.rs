//! Clients for the P-Chain and Info APIs of an Avalanche node.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonrpsee::{
    core::{client::ClientT, params::ObjectParams},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::Deserialize;

use super::{PChainHeight, SubnetValidators, ValidatorInfo};
use crate::{
    crypto::{BlsPublicKey, Id, NodeId},
    serde_util::num_as_str,
};

#[async_trait]
pub trait PChainClient: Send + Sync + 'static {
    /// The latest accepted P-Chain height.
    async fn height(&self) -> Result<u64>;

    async fn validators_at(&self, subnet: Id, height: PChainHeight) -> Result<Vec<ValidatorInfo>>;

    /// The validators of every subnet at `height`.
    async fn all_validators_at(&self, height: PChainHeight) -> Result<SubnetValidators>;
}

#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// The identity of the node whose peers we use.
    async fn node_id(&self) -> Result<NodeId>;

    async fn connected_peers(&self) -> Result<HashSet<NodeId>>;
}

fn http_client(base_url: &str, path: &str, timeout: Duration) -> Result<HttpClient> {
    let url = format!("{}/{path}", base_url.trim_end_matches('/'));
    HttpClientBuilder::default()
        .request_timeout(timeout)
        .build(&url)
        .with_context(|| format!("invalid API url {url}"))
}

fn height_param(height: PChainHeight) -> String {
    match height {
        PChainHeight::Current => "proposed".to_owned(),
        PChainHeight::At(height) => height.to_string(),
    }
}

pub struct PlatformApiClient {
    client: HttpClient,
}

impl PlatformApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(PlatformApiClient {
            client: http_client(base_url, "ext/bc/P", timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct GetHeightResponse {
    #[serde(with = "num_as_str")]
    height: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeValidator {
    public_key: Option<BlsPublicKey>,
    #[serde(with = "num_as_str")]
    weight: u64,
}

#[derive(Deserialize)]
struct GetValidatorsAtResponse {
    validators: HashMap<NodeId, NodeValidator>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WarpValidator {
    public_key: BlsPublicKey,
    #[serde(with = "num_as_str")]
    weight: u64,
    #[serde(rename = "nodeIDs")]
    node_ids: Vec<NodeId>,
}

#[derive(Deserialize)]
struct WarpSet {
    validators: Vec<WarpValidator>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetAllValidatorsAtResponse {
    validator_sets: HashMap<Id, WarpSet>,
}

/// Expand a set whose validators are already merged by key back into one entry per node. The whole weight is
/// attributed to the first node, so merging the entries by key again yields the original set.
fn expand_warp_set(set: WarpSet) -> Vec<ValidatorInfo> {
    set.validators
        .into_iter()
        .flat_map(|v| {
            v.node_ids
                .into_iter()
                .enumerate()
                .map(move |(i, node_id)| ValidatorInfo {
                    node_id,
                    public_key: Some(v.public_key),
                    weight: if i == 0 { v.weight } else { 0 },
                })
        })
        .collect()
}

#[async_trait]
impl PChainClient for PlatformApiClient {
    async fn height(&self) -> Result<u64> {
        let response: GetHeightResponse = self
            .client
            .request("platform.getHeight", rpc_params![])
            .await
            .context("platform.getHeight")?;
        Ok(response.height)
    }

    async fn validators_at(&self, subnet: Id, height: PChainHeight) -> Result<Vec<ValidatorInfo>> {
        let mut params = ObjectParams::new();
        params.insert("subnetID", subnet)?;
        params.insert("height", height_param(height))?;
        let response: GetValidatorsAtResponse = self
            .client
            .request("platform.getValidatorsAt", params)
            .await
            .with_context(|| format!("platform.getValidatorsAt({subnet}, {height})"))?;
        Ok(response
            .validators
            .into_iter()
            .map(|(node_id, v)| ValidatorInfo {
                node_id,
                public_key: v.public_key,
                weight: v.weight,
            })
            .collect())
    }

    async fn all_validators_at(&self, height: PChainHeight) -> Result<SubnetValidators> {
        let mut params = ObjectParams::new();
        params.insert("height", height_param(height))?;
        let response: GetAllValidatorsAtResponse = self
            .client
            .request("platform.getAllValidatorsAt", params)
            .await
            .with_context(|| format!("platform.getAllValidatorsAt({height})"))?;
        Ok(response
            .validator_sets
            .into_iter()
            .map(|(subnet, set)| (subnet, expand_warp_set(set)))
            .collect())
    }
}

pub struct InfoApiClient {
    client: HttpClient,
}

impl InfoApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(InfoApiClient {
            client: http_client(base_url, "ext/info", timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct GetNodeIdResponse {
    #[serde(rename = "nodeID")]
    node_id: NodeId,
}

#[derive(Deserialize)]
struct Peer {
    #[serde(rename = "nodeID")]
    node_id: NodeId,
}

#[derive(Deserialize)]
struct PeersResponse {
    #[serde(default)]
    peers: Vec<Peer>,
}

#[async_trait]
impl PeerNetwork for InfoApiClient {
    async fn node_id(&self) -> Result<NodeId> {
        let response: GetNodeIdResponse = self
            .client
            .request("info.getNodeID", rpc_params![])
            .await
            .context("info.getNodeID")?;
        Ok(response.node_id)
    }

    async fn connected_peers(&self) -> Result<HashSet<NodeId>> {
        let response: PeersResponse = self
            .client
            .request("info.peers", ObjectParams::new())
            .await
            .context("info.peers")?;
        Ok(response.peers.into_iter().map(|p| p.node_id).collect())
    }
}
