//! Core types for the unit graph and main-chain bookkeeping

use crate::error::StructuralError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Content-derived unit identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UnitId(pub [u8; 32]);

impl UnitId {
    /// Derive the identifier from the unit's header fields
    pub fn compute(
        parents: &[UnitId],
        authors: &[Address],
        witness_list: &WitnessListRef,
        timestamp: u64,
    ) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("dag-mainchain.unit.id");
        hasher.update(&(parents.len() as u32).to_le_bytes());
        for parent in parents {
            hasher.update(&parent.0);
        }
        hasher.update(&(authors.len() as u32).to_le_bytes());
        for author in authors {
            hasher.update(&(author.0.len() as u32).to_le_bytes());
            hasher.update(author.0.as_bytes());
        }
        match witness_list {
            WitnessListRef::Inline(addresses) => {
                hasher.update(&[0u8]);
                for address in addresses {
                    hasher.update(&(address.0.len() as u32).to_le_bytes());
                    hasher.update(address.0.as_bytes());
                }
            }
            WitnessListRef::SameAs(unit) => {
                hasher.update(&[1u8]);
                hasher.update(&unit.0);
            }
        }
        hasher.update(&timestamp.to_le_bytes());
        UnitId(*hasher.finalize().as_bytes())
    }

    /// First characters of the base58 form, for log lines
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl AsRef<[u8]> for UnitId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.short())
    }
}

/// Error parsing a base58 unit id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseUnitIdError {
    #[error("invalid base58: {0}")]
    Encoding(String),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for UnitId {
    type Err = ParseUnitIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ParseUnitIdError::Encoding(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseUnitIdError::Length(bytes.len()))?;
        Ok(UnitId(arr))
    }
}

impl Serialize for UnitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for UnitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(UnitId)
        }
    }
}

/// Author / witness address
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Address(s.into())
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// A resolved, validated witness list (sorted, distinct)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WitnessList(Arc<[Address]>);

impl WitnessList {
    /// Validate a list against the expected witness count
    pub fn new(addresses: Vec<Address>, expected_count: usize) -> Result<Self, StructuralError> {
        let distinct: BTreeSet<Address> = addresses.iter().cloned().collect();
        if addresses.len() != expected_count || distinct.len() != addresses.len() {
            return Err(StructuralError::InvalidWitnessList {
                expected: expected_count,
                found: addresses.len(),
                distinct: distinct.len(),
            });
        }
        Ok(WitnessList(distinct.into_iter().collect::<Vec<_>>().into()))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.0.binary_search(address).is_ok()
    }

    /// Number of addresses in `self` that are absent from `other`
    pub fn mutations_from(&self, other: &WitnessList) -> usize {
        if Arc::ptr_eq(&self.0, &other.0) {
            return 0;
        }
        self.0.iter().filter(|a| !other.contains(a)).count()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a unit declares its witnesses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WitnessListRef {
    /// Full list carried by the unit
    Inline(Vec<Address>),
    /// Same list as an earlier unit that carries it inline
    SameAs(UnitId),
}

/// Sequence classification of a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sequence {
    #[default]
    Good,
    /// Flagged by validation; resolved when the unit becomes stable
    TempBad,
    FinalBad,
}

/// A unit as submitted to the node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub parents: Vec<UnitId>,
    pub authors: Vec<Address>,
    pub witness_list: WitnessListRef,
    #[serde(default)]
    pub sequence: Sequence,
    /// Advisory only, not used for ordering
    #[serde(default)]
    pub timestamp: u64,
}

impl Unit {
    /// Build a unit and derive its id
    pub fn new(
        parents: Vec<UnitId>,
        authors: Vec<Address>,
        witness_list: WitnessListRef,
        sequence: Sequence,
        timestamp: u64,
    ) -> Self {
        let id = UnitId::compute(&parents, &authors, &witness_list, timestamp);
        Self {
            id,
            parents,
            authors,
            witness_list,
            sequence,
            timestamp,
        }
    }

    /// Check that the id matches the header fields
    pub fn has_valid_id(&self) -> bool {
        UnitId::compute(&self.parents, &self.authors, &self.witness_list, self.timestamp) == self.id
    }
}

/// Unit record served by the unit store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub id: UnitId,
    pub parents: Vec<UnitId>,
    pub authors: Vec<Address>,
    pub level: u64,
    pub witness_list: WitnessListRef,
    pub sequence: Sequence,
}

/// An admitted unit: immutable once created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitNode {
    pub id: UnitId,
    pub parents: Vec<UnitId>,
    pub authors: Vec<Address>,
    pub level: u64,
    pub witnessed_level: u64,
    pub best_parent: Option<UnitId>,
    pub witness_list: WitnessList,
    /// Sequence as declared by validation
    pub declared_sequence: Sequence,
}

impl UnitNode {
    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_authored_by_witness(&self, witnesses: &WitnessList) -> bool {
        self.authors.iter().any(|a| witnesses.contains(a))
    }
}

/// Mutable consensus state of an admitted unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub is_on_main_chain: bool,
    pub main_chain_index: Option<u64>,
    pub is_stable: bool,
    /// MCI whose stabilization made this unit stable
    pub stabilized_at_mci: Option<u64>,
    pub sequence: Sequence,
}

impl UnitStatus {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }
}

/// Notification emitted once per unit after its stabilization is durable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilizedUnit {
    /// Position in the durable outbox
    pub seq: u64,
    pub unit: UnitId,
    pub mci: u64,
    pub sequence: Sequence,
    pub on_main_chain: bool,
}

/// What to do with later units whose witness list drifted too far
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyWitnessRule {
    /// Skip them when measuring the main chain's witnessed level
    #[default]
    Exclude,
    /// Abort the batch so an operator can look at it
    Reject,
}

/// Consensus policy parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Witnesses per list
    pub witness_count: usize,
    /// Distinct witnesses needed for a witnessed level
    pub majority: usize,
    /// Allowed witness-list differences against the last stable unit
    pub max_witness_list_mutations: usize,
    pub legacy_witness_rule: LegacyWitnessRule,
    /// Hard cap on units visited by any single traversal
    pub max_traversal: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            witness_count: crate::COUNT_WITNESSES,
            majority: crate::MAJORITY_OF_WITNESSES,
            max_witness_list_mutations: crate::MAX_WITNESS_LIST_MUTATIONS,
            legacy_witness_rule: LegacyWitnessRule::Exclude,
            max_traversal: crate::MAX_TRAVERSAL,
        }
    }
}

/// Snapshot of a unit for the query surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitView {
    pub unit: UnitId,
    pub level: u64,
    pub witnessed_level: u64,
    pub best_parent: Option<UnitId>,
    pub is_free: bool,
    #[serde(flatten)]
    pub status: UnitStatus,
}

/// Stats about the local ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusStats {
    pub units: usize,
    pub free_units: usize,
    pub main_chain_top: Option<u64>,
    pub last_stable_mci: u64,
    pub unstable_units: usize,
    pub reorgs: u64,
    pub stabilized_units: u64,
}
