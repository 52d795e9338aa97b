//! DAG Consensus - witness-weighted main chain and finality
//!
//! Architecture:
//! - Units are recorded in a `UnitStore` after structural validation
//! - The `Coordinator` admits them one batch at a time under a single writer role
//! - Each batch computes witnessed level and best parent, rebuilds the main
//!   chain and advances the stability point
//! - The batch commits atomically through a `ConsensusStore` before it is
//!   published and stabilization events are delivered

pub mod admission;
pub mod best_parent;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod graph;
pub mod main_chain;
pub mod reorg;
pub mod stability;
pub mod store;
pub mod types;
pub mod unit_store;
pub mod witness_level;

pub use coordinator::{AdmitOutcome, Coordinator, CoordinatorBuilder};
pub use error::{ConsensusError, ConsensusResult, InvariantViolation, StoreError, StructuralError};
pub use events::{EventBus, FinalBadResolver, SequenceResolver, StabilityListener};
pub use graph::{GraphView, Ledger};
pub use stability::StabilityVerdict;
pub use store::{CommitBatch, ConsensusStore, MemoryStore, PersistedLedger};
pub use types::*;
pub use unit_store::{MemoryUnitStore, UnitStore};

/// Witnesses per witness list
pub const COUNT_WITNESSES: usize = 12;

/// Distinct witnesses needed for a witnessed level
pub const MAJORITY_OF_WITNESSES: usize = 7;

/// Witness-list differences tolerated against the last stable unit
pub const MAX_WITNESS_LIST_MUTATIONS: usize = 1;

/// Upper bound on units visited by one traversal
pub const MAX_TRAVERSAL: usize = 1_000_000;
