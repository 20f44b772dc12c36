//! Identifiers and key material used to address chains, subnets and validators.
//!
//! Chain and subnet IDs are 32-byte values, node IDs are 20-byte values. Both are rendered in the CB58 encoding used by
//! the P-Chain APIs (base58 with a 4-byte SHA-256 checksum), node IDs additionally carry a `NodeID-` prefix.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use anyhow::{Result, anyhow};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Unexpected},
};
use sha2::{Digest, Sha256};

const CHECKSUM_LEN: usize = 4;
const NODE_ID_PREFIX: &str = "NodeID-";

fn cb58_encode(bytes: &[u8]) -> String {
    let checksum = Sha256::digest(bytes);
    let mut buf = Vec::with_capacity(bytes.len() + CHECKSUM_LEN);
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(&checksum[checksum.len() - CHECKSUM_LEN..]);
    bs58::encode(buf).into_string()
}

fn cb58_decode(s: &str) -> Result<Vec<u8>> {
    let mut bytes = bs58::decode(s).into_vec()?;
    if bytes.len() < CHECKSUM_LEN {
        return Err(anyhow!("cb58 string {s} is too short"));
    }
    let checksum = bytes.split_off(bytes.len() - CHECKSUM_LEN);
    let expected = Sha256::digest(&bytes);
    if checksum[..] != expected[expected.len() - CHECKSUM_LEN..] {
        return Err(anyhow!("cb58 string {s} has an invalid checksum"));
    }
    Ok(bytes)
}

/// A 32-byte identifier of a blockchain or subnet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id(pub [u8; 32]);

impl Id {
    /// The ID of the primary network.
    pub const ZERO: Id = Id([0; 32]);

    pub fn from_bytes(bytes: &[u8]) -> Result<Id> {
        Ok(Id(bytes
            .try_into()
            .map_err(|_| anyhow!("expected 32 bytes, got {}", bytes.len()))?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&cb58_encode(&self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Id::from_bytes(&cb58_decode(s)?)
    }
}

/// The identity of a single validator node, derived from its staking certificate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> Result<NodeId> {
        Ok(NodeId(bytes.try_into().map_err(|_| {
            anyhow!("expected 20 bytes, got {}", bytes.len())
        })?))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_ID_PREFIX}{}", cb58_encode(&self.0))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let encoded = s
            .strip_prefix(NODE_ID_PREFIX)
            .ok_or_else(|| anyhow!("node ID {s} does not start with {NODE_ID_PREFIX}"))?;
        NodeId::from_bytes(&cb58_decode(encoded)?)
    }
}

/// A compressed BLS public key. Keys are only compared and ordered here, never used for verification.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlsPublicKey(pub [u8; 48]);

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<BlsPublicKey> {
        Ok(BlsPublicKey(bytes.try_into().map_err(|_| {
            anyhow!("expected a 48 byte public key, got {} bytes", bytes.len())
        })?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for BlsPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for BlsPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({self})")
    }
}

impl FromStr for BlsPublicKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BlsPublicKey::from_bytes(&hex::decode(s.trim_start_matches("0x"))?)
    }
}

macro_rules! string_serde {
    ($ty:ty, $expected:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.to_string().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse()
                    .map_err(|_| de::Error::invalid_value(Unexpected::Str(&s), &$expected))
            }
        }
    };
}

string_serde!(Id, "a cb58 encoded 32-byte ID");
string_serde!(NodeId, "a NodeID- prefixed cb58 string");
string_serde!(BlsPublicKey, "a hex encoded 48-byte public key");
