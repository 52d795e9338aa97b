//! Durable store contract for consensus state
//!
//! Everything one stabilization batch produces (new units, status changes,
//! main-chain clears and assignments, the stability frontier and the queued
//! notifications) goes through a single `commit` call that must be
//! all-or-nothing.

use crate::error::StoreError;
use crate::types::{StabilizedUnit, UnitId, UnitNode, UnitStatus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// All mutations produced by one writer pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    pub new_units: Vec<UnitNode>,
    pub status_updates: Vec<(UnitId, UnitStatus)>,
    pub main_chain_cleared: Vec<u64>,
    pub main_chain_assigned: Vec<(u64, UnitId)>,
    pub last_stable_mci: Option<u64>,
    pub notifications: Vec<StabilizedUnit>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.new_units.is_empty()
            && self.status_updates.is_empty()
            && self.main_chain_cleared.is_empty()
            && self.main_chain_assigned.is_empty()
            && self.last_stable_mci.is_none()
            && self.notifications.is_empty()
    }
}

/// Ledger contents as reloaded on startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedLedger {
    pub units: Vec<UnitNode>,
    pub statuses: Vec<(UnitId, UnitStatus)>,
    pub main_chain: Vec<(u64, UnitId)>,
    pub last_stable_mci: u64,
    /// Highest outbox sequence ever committed
    pub last_event_seq: u64,
    /// Committed notifications not yet acknowledged as delivered
    pub pending_notifications: Vec<StabilizedUnit>,
}

/// Transactional storage for consensus state
pub trait ConsensusStore: Send + Sync {
    /// Load the committed ledger (empty when fresh)
    fn load(&self) -> Result<PersistedLedger, StoreError>;

    /// Apply the whole batch durably, or nothing at all
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;

    /// Acknowledge delivery of every notification up to `seq`
    fn mark_delivered(&self, seq: u64) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    units: BTreeMap<UnitId, UnitNode>,
    statuses: HashMap<UnitId, UnitStatus>,
    main_chain: BTreeMap<u64, UnitId>,
    last_stable_mci: u64,
    outbox: BTreeMap<u64, StabilizedUnit>,
    last_event_seq: u64,
}

/// In-memory consensus store
///
/// Commits apply under one lock. Failures can be injected to exercise the
/// rollback path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failures_to_inject: AtomicUsize,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail without applying anything
    pub fn fail_next_commits(&self, n: usize) {
        self.failures_to_inject.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Committed status of a unit
    pub fn status(&self, id: &UnitId) -> Option<UnitStatus> {
        self.state.lock().statuses.get(id).cloned()
    }

    pub fn outbox_len(&self) -> usize {
        self.state.lock().outbox.len()
    }
}

impl ConsensusStore for MemoryStore {
    fn load(&self) -> Result<PersistedLedger, StoreError> {
        let state = self.state.lock();
        Ok(PersistedLedger {
            units: state.units.values().cloned().collect(),
            statuses: state.statuses.iter().map(|(k, v)| (*k, v.clone())).collect(),
            main_chain: state.main_chain.iter().map(|(k, v)| (*k, *v)).collect(),
            last_stable_mci: state.last_stable_mci,
            last_event_seq: state.last_event_seq,
            pending_notifications: state.outbox.values().cloned().collect(),
        })
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let injected = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::CommitFailed("injected failure".to_string()));
        }

        let mut state = self.state.lock();
        for node in &batch.new_units {
            state.units.insert(node.id, node.clone());
        }
        for (id, status) in &batch.status_updates {
            state.statuses.insert(*id, status.clone());
        }
        for mci in &batch.main_chain_cleared {
            state.main_chain.remove(mci);
        }
        for (mci, id) in &batch.main_chain_assigned {
            state.main_chain.insert(*mci, *id);
        }
        if let Some(mci) = batch.last_stable_mci {
            state.last_stable_mci = mci;
        }
        for event in &batch.notifications {
            state.last_event_seq = state.last_event_seq.max(event.seq);
            state.outbox.insert(event.seq, event.clone());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mark_delivered(&self, seq: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let remaining = state.outbox.split_off(&(seq + 1));
        state.outbox = remaining;
        Ok(())
    }
}
