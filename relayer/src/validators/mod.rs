//! Validator sets and the canonical ordering used to index aggregate signatures.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display, Formatter},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{BlsPublicKey, Id, NodeId},
    error::ValidatorError,
};

pub mod client;
pub mod manager;

/// The P-Chain state to read validators from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PChainHeight {
    /// The proposed state. It can change between two reads, so it is never cached.
    Current,
    /// The immutable snapshot at a specific height.
    At(u64),
}

impl Display for PChainHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PChainHeight::Current => write!(f, "current"),
            PChainHeight::At(height) => write!(f, "{height}"),
        }
    }
}

/// A single validator node as reported by the P-Chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub node_id: NodeId,
    /// Validators without a registered BLS key cannot sign warp messages.
    pub public_key: Option<BlsPublicKey>,
    pub weight: u64,
}

/// Validator sets of every subnet at one P-Chain height.
pub type SubnetValidators = HashMap<Id, Vec<ValidatorInfo>>;

/// One signer in a canonical validator set. Several nodes registered with the same BLS key are a single signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalValidator {
    pub public_key: BlsPublicKey,
    pub weight: u64,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalValidatorSet {
    /// Ordered by public key. A validator's position is its bit in a signature's signer bitset.
    pub validators: Vec<CanonicalValidator>,
    pub total_weight: u64,
}

impl CanonicalValidatorSet {
    pub fn from_validators(
        subnet: Id,
        validators: &[ValidatorInfo],
    ) -> Result<Self, ValidatorError> {
        let mut by_key: BTreeMap<BlsPublicKey, CanonicalValidator> = BTreeMap::new();
        let mut total_weight = 0u64;
        for validator in validators {
            let Some(public_key) = validator.public_key else {
                continue;
            };
            total_weight = total_weight
                .checked_add(validator.weight)
                .ok_or(ValidatorError::WeightOverflow(subnet))?;
            let entry = by_key
                .entry(public_key)
                .or_insert_with(|| CanonicalValidator {
                    public_key,
                    weight: 0,
                    node_ids: vec![],
                });
            // Cannot overflow, since the total did not.
            entry.weight += validator.weight;
            entry.node_ids.push(validator.node_id);
        }

        let validators = by_key
            .into_values()
            .map(|mut v| {
                v.node_ids.sort();
                v.node_ids.dedup();
                v
            })
            .collect();
        Ok(CanonicalValidatorSet {
            validators,
            total_weight,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// A canonical validator set together with which of its validators we are currently connected to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalValidators {
    pub validator_set: CanonicalValidatorSet,
    pub connected_weight: u64,
    pub connected_nodes: HashSet<NodeId>,
    /// Maps every node to the index of its validator in `validator_set`.
    pub node_validator_index: HashMap<NodeId, usize>,
}

impl CanonicalValidators {
    pub fn total_weight(&self) -> u64 {
        self.validator_set.total_weight
    }

    pub fn validator(&self, node_id: &NodeId) -> Option<&CanonicalValidator> {
        let index = *self.node_validator_index.get(node_id)?;
        self.validator_set.validators.get(index)
    }

    pub fn connected_weight_meets_quorum(&self, numerator: u64, denominator: u64) -> bool {
        check_stake_weight_exceeds_threshold(
            self.connected_weight,
            self.total_weight(),
            numerator,
            denominator,
        )
    }
}

pub fn build_canonical_validators(
    validator_set: CanonicalValidatorSet,
    connected_peers: &HashSet<NodeId>,
) -> CanonicalValidators {
    let node_validator_index: HashMap<NodeId, usize> = validator_set
        .validators
        .iter()
        .enumerate()
        .flat_map(|(index, v)| v.node_ids.iter().map(move |node_id| (*node_id, index)))
        .collect();

    let connected_nodes: HashSet<NodeId> = node_validator_index
        .keys()
        .filter(|node_id| connected_peers.contains(node_id))
        .copied()
        .collect();

    // Count each validator once, however many of its nodes are connected.
    let connected_weight = connected_nodes
        .iter()
        .map(|node_id| node_validator_index[node_id])
        .unique()
        .map(|index| validator_set.validators[index].weight)
        .sum();

    CanonicalValidators {
        validator_set,
        connected_weight,
        connected_nodes,
        node_validator_index,
    }
}

/// Whether `weight` is at least `numerator / denominator` of `total_weight`.
pub fn check_stake_weight_exceeds_threshold(
    weight: u64,
    total_weight: u64,
    numerator: u64,
    denominator: u64,
) -> bool {
    u128::from(numerator) * u128::from(total_weight) <= u128::from(denominator) * u128::from(weight)
}
