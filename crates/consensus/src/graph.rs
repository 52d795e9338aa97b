//! Graph views over admitted units
//!
//! `Ledger` is the committed, published state. `Staged` overlays a
//! `LedgerDelta` on top of it; the writer computes everything against the
//! staged view and the delta is only applied after the durable commit.

use crate::error::{ConsensusResult, InvariantViolation};
use crate::store::{CommitBatch, PersistedLedger};
use crate::types::{ConsensusStats, StabilizedUnit, UnitId, UnitNode, UnitStatus, UnitView};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Read access shared by the committed ledger and the writer's staged view
pub trait GraphView {
    fn node(&self, id: &UnitId) -> Option<Arc<UnitNode>>;

    fn status(&self, id: &UnitId) -> Option<UnitStatus>;

    /// Units whose best parent is `id`, in id order
    fn best_children(&self, id: &UnitId) -> Vec<UnitId>;

    fn is_free(&self, id: &UnitId) -> bool;

    /// Free units in id order
    fn free_units(&self) -> Vec<UnitId>;

    fn main_chain_unit(&self, mci: u64) -> Option<UnitId>;

    fn main_chain_top(&self) -> Option<u64>;

    fn last_stable_mci(&self) -> u64;
}

/// Committed ledger state
#[derive(Debug, Default)]
pub struct Ledger {
    nodes: HashMap<UnitId, Arc<UnitNode>>,
    children: HashMap<UnitId, BTreeSet<UnitId>>,
    best_children: HashMap<UnitId, BTreeSet<UnitId>>,
    free: BTreeSet<UnitId>,
    statuses: HashMap<UnitId, UnitStatus>,
    main_chain: BTreeMap<u64, UnitId>,
    last_stable_mci: u64,
    event_seq: u64,
    reorgs: u64,
    stabilized: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the ledger and its indexes from persisted state
    pub fn from_persisted(persisted: PersistedLedger) -> Result<Self, InvariantViolation> {
        let mut ledger = Ledger::new();
        let mut units = persisted.units;
        units.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));

        let statuses: HashMap<UnitId, UnitStatus> = persisted.statuses.into_iter().collect();
        for node in units {
            for parent in &node.parents {
                if !ledger.nodes.contains_key(parent) {
                    return Err(InvariantViolation::CorruptLedger(format!(
                        "unit {} references missing parent {}",
                        node.id, parent
                    )));
                }
            }
            let status = statuses.get(&node.id).cloned().ok_or_else(|| {
                InvariantViolation::CorruptLedger(format!("unit {} has no status", node.id))
            })?;
            if status.is_stable {
                ledger.stabilized += 1;
            }
            ledger.statuses.insert(node.id, status);
            ledger.link(Arc::new(node));
        }

        for (mci, id) in persisted.main_chain {
            let on_chain = ledger
                .statuses
                .get(&id)
                .map(|s| s.is_on_main_chain && s.main_chain_index == Some(mci))
                .unwrap_or(false);
            if !on_chain {
                return Err(InvariantViolation::CorruptLedger(format!(
                    "main chain entry {} -> {} disagrees with unit status",
                    mci, id
                )));
            }
            ledger.main_chain.insert(mci, id);
        }
        if !ledger.nodes.is_empty() && !ledger.main_chain.contains_key(&persisted.last_stable_mci) {
            return Err(InvariantViolation::MissingMainChainUnit(persisted.last_stable_mci));
        }
        ledger.last_stable_mci = persisted.last_stable_mci;
        ledger.event_seq = persisted.last_event_seq;
        Ok(ledger)
    }

    fn link(&mut self, node: Arc<UnitNode>) {
        for parent in &node.parents {
            self.children.entry(*parent).or_default().insert(node.id);
            self.free.remove(parent);
        }
        if let Some(best_parent) = node.best_parent {
            self.best_children.entry(best_parent).or_default().insert(node.id);
        }
        self.free.insert(node.id);
        self.nodes.insert(node.id, node);
    }

    /// Publish a committed delta
    pub fn apply(&mut self, delta: LedgerDelta) {
        for id in &delta.admitted {
            if let Some(node) = delta.nodes.get(id) {
                self.nodes.insert(*id, node.clone());
            }
        }
        self.children.extend(delta.children);
        self.best_children.extend(delta.best_children);
        self.free = delta.free;
        self.statuses.extend(delta.statuses);
        for (mci, entry) in delta.main_chain {
            match entry {
                Some(id) => {
                    self.main_chain.insert(mci, id);
                }
                None => {
                    self.main_chain.remove(&mci);
                }
            }
        }
        self.last_stable_mci = delta.last_stable_mci;
        self.event_seq = delta.event_seq;
        self.reorgs += delta.reorgs;
        self.stabilized += delta.stabilized;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn children_of(&self, id: &UnitId) -> BTreeSet<UnitId> {
        self.children.get(id).cloned().unwrap_or_default()
    }

    pub fn event_seq(&self) -> u64 {
        self.event_seq
    }

    /// Main chain from MCI 0 upward
    pub fn main_chain(&self) -> Vec<(u64, UnitId)> {
        self.main_chain.iter().map(|(mci, id)| (*mci, *id)).collect()
    }

    /// All admitted ids
    pub fn unit_ids(&self) -> impl Iterator<Item = &UnitId> {
        self.nodes.keys()
    }

    pub fn view(&self, id: &UnitId) -> Option<UnitView> {
        let node = self.nodes.get(id)?;
        let status = self.statuses.get(id)?.clone();
        Some(UnitView {
            unit: node.id,
            level: node.level,
            witnessed_level: node.witnessed_level,
            best_parent: node.best_parent,
            is_free: self.free.contains(id),
            status,
        })
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            units: self.nodes.len(),
            free_units: self.free.len(),
            main_chain_top: self.main_chain_top(),
            last_stable_mci: self.last_stable_mci,
            unstable_units: self.statuses.values().filter(|s| !s.is_stable).count(),
            reorgs: self.reorgs,
            stabilized_units: self.stabilized,
        }
    }
}

impl GraphView for Ledger {
    fn node(&self, id: &UnitId) -> Option<Arc<UnitNode>> {
        self.nodes.get(id).cloned()
    }

    fn status(&self, id: &UnitId) -> Option<UnitStatus> {
        self.statuses.get(id).cloned()
    }

    fn best_children(&self, id: &UnitId) -> Vec<UnitId> {
        self.best_children
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn is_free(&self, id: &UnitId) -> bool {
        self.free.contains(id)
    }

    fn free_units(&self) -> Vec<UnitId> {
        self.free.iter().copied().collect()
    }

    fn main_chain_unit(&self, mci: u64) -> Option<UnitId> {
        self.main_chain.get(&mci).copied()
    }

    fn main_chain_top(&self) -> Option<u64> {
        self.main_chain.keys().next_back().copied()
    }

    fn last_stable_mci(&self) -> u64 {
        self.last_stable_mci
    }
}

/// Changes staged by the writer, not yet committed
#[derive(Debug, Default)]
pub struct LedgerDelta {
    nodes: HashMap<UnitId, Arc<UnitNode>>,
    admitted: Vec<UnitId>,
    children: HashMap<UnitId, BTreeSet<UnitId>>,
    best_children: HashMap<UnitId, BTreeSet<UnitId>>,
    free: BTreeSet<UnitId>,
    statuses: BTreeMap<UnitId, UnitStatus>,
    /// `None` marks a cleared index
    main_chain: BTreeMap<u64, Option<UnitId>>,
    main_chain_top: Option<u64>,
    last_stable_mci: u64,
    stable_advanced: bool,
    notifications: Vec<StabilizedUnit>,
    event_seq: u64,
    reorgs: u64,
    stabilized: u64,
}

impl LedgerDelta {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
            && self.statuses.is_empty()
            && self.main_chain.is_empty()
            && !self.stable_advanced
    }

    pub fn notifications(&self) -> &[StabilizedUnit] {
        &self.notifications
    }

    pub fn reorgs(&self) -> u64 {
        self.reorgs
    }

    /// The durable form of this delta
    pub fn commit_batch(&self) -> CommitBatch {
        let mut batch = CommitBatch {
            new_units: self
                .admitted
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|node| node.as_ref().clone())
                .collect(),
            status_updates: self.statuses.iter().map(|(id, s)| (*id, s.clone())).collect(),
            last_stable_mci: self.stable_advanced.then_some(self.last_stable_mci),
            notifications: self.notifications.clone(),
            ..Default::default()
        };
        for (mci, entry) in &self.main_chain {
            match entry {
                Some(id) => batch.main_chain_assigned.push((*mci, *id)),
                None => batch.main_chain_cleared.push(*mci),
            }
        }
        batch
    }
}

/// The committed ledger with the writer's delta laid over it
pub struct Staged<'a> {
    base: &'a Ledger,
    delta: LedgerDelta,
}

impl<'a> Staged<'a> {
    pub fn new(base: &'a Ledger) -> Self {
        let delta = LedgerDelta {
            free: base.free.clone(),
            main_chain_top: base.main_chain_top(),
            last_stable_mci: base.last_stable_mci,
            event_seq: base.event_seq,
            ..Default::default()
        };
        Self { base, delta }
    }

    pub fn into_delta(self) -> LedgerDelta {
        self.delta
    }

    pub fn delta(&self) -> &LedgerDelta {
        &self.delta
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.delta.admitted.is_empty()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.delta.nodes.contains_key(id) || self.base.contains(id)
    }

    /// Add a prepared unit as a new free unit
    pub fn insert_node(&mut self, node: UnitNode) {
        let node = Arc::new(node);
        for parent in &node.parents {
            let base = self.base;
            self.delta
                .children
                .entry(*parent)
                .or_insert_with(|| base.children_of(parent))
                .insert(node.id);
            self.delta.free.remove(parent);
        }
        if let Some(best_parent) = node.best_parent {
            let base = self.base;
            self.delta
                .best_children
                .entry(best_parent)
                .or_insert_with(|| base.best_children.get(&best_parent).cloned().unwrap_or_default())
                .insert(node.id);
        }
        self.delta.free.insert(node.id);
        self.delta
            .statuses
            .insert(node.id, UnitStatus::new(node.declared_sequence));
        self.delta.admitted.push(node.id);
        self.delta.nodes.insert(node.id, node);
    }

    pub fn set_status(&mut self, id: UnitId, status: UnitStatus) {
        self.delta.statuses.insert(id, status);
    }

    pub fn clear_main_chain(&mut self, mci: u64) {
        self.delta.main_chain.insert(mci, None);
    }

    pub fn assign_main_chain(&mut self, mci: u64, id: UnitId) {
        self.delta.main_chain.insert(mci, Some(id));
    }

    pub fn set_main_chain_top(&mut self, top: Option<u64>) {
        self.delta.main_chain_top = top;
    }

    pub fn set_last_stable_mci(&mut self, mci: u64) {
        self.delta.last_stable_mci = mci;
        self.delta.stable_advanced = true;
    }

    pub fn record_reorg(&mut self) {
        self.delta.reorgs += 1;
    }

    /// Queue a stabilization notification, assigning its outbox sequence
    pub fn push_notification(&mut self, unit: UnitId, mci: u64, status: &UnitStatus) {
        self.delta.event_seq += 1;
        self.delta.stabilized += 1;
        self.delta.notifications.push(StabilizedUnit {
            seq: self.delta.event_seq,
            unit,
            mci,
            sequence: status.sequence,
            on_main_chain: status.is_on_main_chain,
        });
    }
}

impl GraphView for Staged<'_> {
    fn node(&self, id: &UnitId) -> Option<Arc<UnitNode>> {
        self.delta
            .nodes
            .get(id)
            .cloned()
            .or_else(|| self.base.node(id))
    }

    fn status(&self, id: &UnitId) -> Option<UnitStatus> {
        self.delta
            .statuses
            .get(id)
            .cloned()
            .or_else(|| self.base.status(id))
    }

    fn best_children(&self, id: &UnitId) -> Vec<UnitId> {
        match self.delta.best_children.get(id) {
            Some(set) => set.iter().copied().collect(),
            None => self.base.best_children(id),
        }
    }

    fn is_free(&self, id: &UnitId) -> bool {
        self.delta.free.contains(id)
    }

    fn free_units(&self) -> Vec<UnitId> {
        self.delta.free.iter().copied().collect()
    }

    fn main_chain_unit(&self, mci: u64) -> Option<UnitId> {
        match self.delta.main_chain.get(&mci) {
            Some(entry) => *entry,
            None => self.base.main_chain_unit(mci),
        }
    }

    fn main_chain_top(&self) -> Option<u64> {
        self.delta.main_chain_top
    }

    fn last_stable_mci(&self) -> u64 {
        self.delta.last_stable_mci
    }
}

/// Fetch an admitted unit or fail
pub fn require_node<V: GraphView + ?Sized>(view: &V, id: &UnitId) -> ConsensusResult<Arc<UnitNode>> {
    view.node(id)
        .ok_or_else(|| InvariantViolation::MissingUnit(*id).into())
}

/// Fetch a parent, checking that it sits strictly below its child
pub fn checked_parent<V: GraphView + ?Sized>(
    view: &V,
    child: &UnitNode,
    parent: &UnitId,
) -> ConsensusResult<Arc<UnitNode>> {
    let node = require_node(view, parent)?;
    if node.level >= child.level {
        return Err(InvariantViolation::CycleDetected {
            unit: child.id,
            parent: *parent,
        }
        .into());
    }
    Ok(node)
}

pub fn best_parent_of<V: GraphView + ?Sized>(
    view: &V,
    node: &UnitNode,
) -> ConsensusResult<Option<Arc<UnitNode>>> {
    match &node.best_parent {
        Some(id) => checked_parent(view, node, id).map(Some),
        None => Ok(None),
    }
}

/// Whether the best-parent chain from `start` reaches `target`
pub fn passes_through<V: GraphView + ?Sized>(
    view: &V,
    start: &Arc<UnitNode>,
    target: &UnitNode,
    limit: usize,
) -> ConsensusResult<bool> {
    let mut current = start.clone();
    let mut steps = 0usize;
    while current.level > target.level {
        steps += 1;
        if steps > limit {
            return Err(InvariantViolation::TraversalLimit { limit }.into());
        }
        match best_parent_of(view, &current)? {
            Some(parent) => current = parent,
            None => return Ok(false),
        }
    }
    Ok(current.id == target.id)
}

/// Ancestors of `start` (inclusive) that are not yet stable
///
/// The walk does not descend below stable units: every ancestor of a stable
/// unit is already stable.
pub fn unstable_ancestors<V: GraphView + ?Sized>(
    view: &V,
    start: &Arc<UnitNode>,
    limit: usize,
) -> ConsensusResult<Vec<Arc<UnitNode>>> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    let mut worklist = vec![start.clone()];
    visited.insert(start.id);

    while let Some(node) = worklist.pop() {
        let stable = view.status(&node.id).map(|s| s.is_stable).unwrap_or(false);
        if stable {
            continue;
        }
        for parent in &node.parents {
            let parent_node = checked_parent(view, &node, parent)?;
            if visited.insert(*parent) {
                if visited.len() > limit {
                    return Err(InvariantViolation::TraversalLimit { limit }.into());
                }
                worklist.push(parent_node);
            }
        }
        found.push(node);
    }

    found.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
    Ok(found)
}
