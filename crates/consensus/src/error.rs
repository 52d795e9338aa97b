//! Consensus errors

use crate::types::UnitId;
use thiserror::Error;

/// Malformed or out-of-order input, rejected at admission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("unit {0} is not in the unit store")]
    UnknownUnit(UnitId),

    #[error("parent unit {0} is not known")]
    UnknownParent(UnitId),

    #[error("witness list unit {0} is not known")]
    UnknownWitnessListUnit(UnitId),

    #[error("witness list unit {0} does not carry an inline list")]
    WitnessListUnitNotInline(UnitId),

    #[error("unit {0} is already known")]
    DuplicateUnit(UnitId),

    #[error("parent {0} is listed twice")]
    DuplicateParent(UnitId),

    #[error("a genesis unit already exists")]
    GenesisAlreadyExists,

    #[error("unit has no authors")]
    NoAuthors,

    #[error("witness list must have {expected} distinct addresses, found {found} ({distinct} distinct)")]
    InvalidWitnessList {
        expected: usize,
        found: usize,
        distinct: usize,
    },

    #[error("declared level {declared} does not match computed level {computed}")]
    LevelMismatch { declared: u64, computed: u64 },

    #[error("unit id does not match its header")]
    InvalidId,
}

/// Broken programming contract; the in-flight batch is aborted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("new stable MCI {proposed} does not follow last stable MCI {current}")]
    NonIncreasingStableMci { current: u64, proposed: u64 },

    #[error("cycle detected: parent {parent} of {unit} is not at a lower level")]
    CycleDetected { unit: UnitId, parent: UnitId },

    #[error("traversal visited more than {limit} units")]
    TraversalLimit { limit: usize },

    #[error("main chain fork at MCI {fork_mci} is below last stable MCI {last_stable_mci}")]
    ReorgBelowStablePoint { fork_mci: u64, last_stable_mci: u64 },

    #[error("no free unit descends from the last stable main-chain unit")]
    NoEligibleTip,

    #[error("unit {unit} has {mutations} witness-list mutations against the stable point")]
    IncompatibleWitnessList { unit: UnitId, mutations: usize },

    #[error("no main-chain unit at MCI {0}")]
    MissingMainChainUnit(u64),

    #[error("unit {0} is referenced but not admitted")]
    MissingUnit(UnitId),

    #[error("unit store disagrees with the ledger about {0}")]
    StoreDivergence(UnitId),

    #[error("persisted ledger is inconsistent: {0}")]
    CorruptLedger(String),
}

/// Durable store failure; the batch is rolled back and may be retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A commit may have been applied without being made durable. The store
    /// refuses further commits until it is reopened and reloaded.
    #[error("store poisoned: {0}")]
    Poisoned(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("structural: {0}")]
    Structural(#[from] StructuralError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl ConsensusError {
    /// Transient failures that leave the ledger untouched and can be retried as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsensusError::Store(e) if !matches!(e, StoreError::Poisoned(_)))
    }
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
