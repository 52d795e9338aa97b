//! Transaction coordinator
//!
//! Owns the committed ledger and serializes every change through one writer
//! role (the upgradable read lock). A writer stages its work against the
//! committed state, commits the resulting batch durably, and only then
//! publishes the delta and delivers notifications. Readers keep reading the
//! committed ledger the whole time.

use crate::admission::prepare_unit;
use crate::error::{ConsensusError, ConsensusResult, InvariantViolation, StructuralError};
use crate::events::{EventBus, FinalBadResolver, SequenceResolver, StabilityListener};
use crate::graph::{GraphView, Ledger, LedgerDelta, Staged};
use crate::reorg::rebuild_main_chain;
use crate::stability::advance_stability;
use crate::store::ConsensusStore;
use crate::types::{
    ConsensusConfig, ConsensusStats, Sequence, StabilizedUnit, UnitId, UnitMeta, UnitNode, UnitStatus,
    UnitView,
};
use crate::unit_store::UnitStore;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Result of admitting one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitOutcome {
    pub unit: UnitId,
    pub level: u64,
    pub witnessed_level: u64,
    pub best_parent: Option<UnitId>,
    /// Index of the new unit if it joined the main chain
    pub main_chain_index: Option<u64>,
    /// Whether admission displaced existing main-chain units
    pub reorg: bool,
    /// MCIs that became stable in this batch
    pub stabilized_mcis: Vec<u64>,
    pub last_stable_mci: u64,
}

/// Builder for Coordinator
pub struct CoordinatorBuilder {
    config: ConsensusConfig,
    unit_store: Arc<dyn UnitStore>,
    store: Arc<dyn ConsensusStore>,
    listeners: Vec<Arc<dyn StabilityListener>>,
    resolver: Arc<dyn SequenceResolver>,
}

impl CoordinatorBuilder {
    pub fn new(unit_store: Arc<dyn UnitStore>, store: Arc<dyn ConsensusStore>) -> Self {
        Self {
            config: ConsensusConfig::default(),
            unit_store,
            store,
            listeners: Vec::new(),
            resolver: Arc::new(FinalBadResolver),
        }
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StabilityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SequenceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Load committed state and redeliver notifications still in the outbox
    pub fn open(self) -> ConsensusResult<Coordinator> {
        let persisted = self.store.load()?;
        let pending = persisted.pending_notifications.clone();
        let ledger = Ledger::from_persisted(persisted)?;

        let coordinator = Coordinator {
            config: self.config,
            ledger: RwLock::new(ledger),
            unit_store: self.unit_store,
            store: self.store,
            events: EventBus::new(self.listeners),
            resolver: self.resolver,
        };

        let stats = coordinator.stats();
        tracing::info!(
            "Coordinator opened: {} units, last stable MCI {}, main chain top {:?}",
            stats.units,
            stats.last_stable_mci,
            stats.main_chain_top
        );

        if !pending.is_empty() {
            tracing::info!("Redelivering {} pending stabilization events", pending.len());
            coordinator.deliver(&pending);
        }
        Ok(coordinator)
    }
}

/// Single entry point for ledger changes and consensus queries
pub struct Coordinator {
    config: ConsensusConfig,
    ledger: RwLock<Ledger>,
    unit_store: Arc<dyn UnitStore>,
    store: Arc<dyn ConsensusStore>,
    events: EventBus,
    resolver: Arc<dyn SequenceResolver>,
}

impl Coordinator {
    pub fn builder(unit_store: Arc<dyn UnitStore>, store: Arc<dyn ConsensusStore>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(unit_store, store)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Admit a recorded unit, rebuild the main chain and advance stability
    ///
    /// Everything happens in one batch: on any error nothing is published and
    /// the writer role is released.
    pub fn add_unit(&self, id: &UnitId) -> ConsensusResult<AdmitOutcome> {
        let meta = self
            .unit_store
            .get_unit(id)
            .ok_or(StructuralError::UnknownUnit(*id))?;

        let writer = self.ledger.upgradable_read();
        let (delta, outcome) = match self.stage(&writer, &meta) {
            Ok(staged) => staged,
            Err(e) => {
                if let ConsensusError::Invariant(violation) = &e {
                    tracing::error!("Aborted batch for unit {}: {}", id.short(), violation);
                } else {
                    tracing::debug!("Rejected unit {}: {}", id.short(), e);
                }
                return Err(e);
            }
        };

        let batch = delta.commit_batch();
        if let Err(e) = self.store.commit(&batch) {
            tracing::error!("Commit failed for unit {}, batch rolled back: {}", id.short(), e);
            return Err(e.into());
        }

        let notifications = delta.notifications().to_vec();
        let mut published = RwLockUpgradableReadGuard::upgrade(writer);
        published.apply(delta);
        let writer = RwLockWriteGuard::downgrade_to_upgradable(published);

        // Delivered under the writer role, in commit order
        self.deliver(&notifications);
        drop(writer);

        tracing::debug!(
            "Admitted unit {} (level {}, wl {}, mci {:?})",
            id.short(),
            outcome.level,
            outcome.witnessed_level,
            outcome.main_chain_index
        );
        Ok(outcome)
    }

    fn stage(&self, ledger: &Ledger, meta: &UnitMeta) -> ConsensusResult<(LedgerDelta, AdmitOutcome)> {
        let mut staged = Staged::new(ledger);
        let node = prepare_unit(&staged, self.unit_store.as_ref(), meta, &self.config)?;
        let (unit, level, witnessed_level, best_parent) =
            (node.id, node.level, node.witnessed_level, node.best_parent);

        let (reorg, stabilized_mcis) = if node.is_genesis() {
            self.stage_genesis(&mut staged, node);
            (false, vec![0])
        } else {
            staged.insert_node(node);
            let rebuilt = rebuild_main_chain(&mut staged, &self.config)?;
            let verdicts = advance_stability(&mut staged, self.resolver.as_ref(), &self.config)?;
            (rebuilt.is_reorg(), verdicts.iter().map(|v| v.mci).collect())
        };

        let outcome = AdmitOutcome {
            unit,
            level,
            witnessed_level,
            best_parent,
            main_chain_index: staged.status(&unit).and_then(|s| s.main_chain_index),
            reorg,
            stabilized_mcis,
            last_stable_mci: staged.last_stable_mci(),
        };
        Ok((staged.into_delta(), outcome))
    }

    /// Genesis is main-chain index 0 and stable from the start
    fn stage_genesis(&self, staged: &mut Staged<'_>, node: UnitNode) {
        let id = node.id;
        let mut status = UnitStatus::new(node.declared_sequence);
        status.is_on_main_chain = true;
        status.main_chain_index = Some(0);
        status.is_stable = true;
        status.stabilized_at_mci = Some(0);
        if status.sequence == Sequence::TempBad {
            status.sequence = match self.resolver.resolve(&node, 0) {
                Sequence::TempBad => Sequence::FinalBad,
                resolved => resolved,
            };
        }

        staged.insert_node(node);
        staged.assign_main_chain(0, id);
        staged.set_main_chain_top(Some(0));
        staged.set_last_stable_mci(0);
        staged.push_notification(id, 0, &status);
        staged.set_status(id, status);
        tracing::info!("Genesis unit {} admitted", id);
    }

    fn deliver(&self, notifications: &[StabilizedUnit]) {
        let Some(last) = notifications.last() else {
            return;
        };
        self.events.deliver(notifications);
        if let Err(e) = self.store.mark_delivered(last.seq) {
            // Undelivered marks only cause redelivery on the next open
            tracing::warn!("Failed to mark events up to {} delivered: {}", last.seq, e);
        }
    }

    /// Admit every unit the unit store holds that the ledger does not
    ///
    /// Walks down from the store's free units and admits in level order.
    /// Units the ledger refuses are logged and skipped; store failures
    /// abort. Returns the number of units admitted.
    pub fn catch_up(&self) -> ConsensusResult<usize> {
        let mut missing: Vec<UnitMeta> = Vec::new();
        {
            let ledger = self.ledger.read();
            let mut visited: HashSet<UnitId> = HashSet::new();
            let mut worklist: Vec<UnitId> = self
                .unit_store
                .get_free_units()
                .into_iter()
                .filter(|id| !ledger.contains(id))
                .collect();
            visited.extend(worklist.iter().copied());

            while let Some(id) = worklist.pop() {
                if visited.len() > self.config.max_traversal {
                    return Err(InvariantViolation::TraversalLimit {
                        limit: self.config.max_traversal,
                    }
                    .into());
                }
                let meta = self
                    .unit_store
                    .get_unit(&id)
                    .ok_or(StructuralError::UnknownUnit(id))?;
                for parent in &meta.parents {
                    if !ledger.contains(parent) && visited.insert(*parent) {
                        worklist.push(*parent);
                    }
                }
                missing.push(meta);
            }
        }

        missing.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
        let mut admitted = 0;
        for meta in &missing {
            match self.add_unit(&meta.id) {
                Ok(_) => admitted += 1,
                Err(ConsensusError::Structural(StructuralError::DuplicateUnit(_))) => {}
                Err(e @ ConsensusError::Store(_)) => return Err(e),
                Err(e) => tracing::warn!("Skipping recorded unit {}: {}", meta.id.short(), e),
            }
        }
        if admitted > 0 {
            tracing::info!("Caught up {} units from the unit store", admitted);
        }
        Ok(admitted)
    }

    /// Check admitted parent/child links against the unit store
    pub fn verify_against_store(&self) -> ConsensusResult<()> {
        let ledger = self.ledger.read();
        for id in ledger.unit_ids() {
            if self.unit_store.get_unit(id).is_none() {
                return Err(InvariantViolation::StoreDivergence(*id).into());
            }
            let admitted = ledger.children_of(id);
            let recorded: BTreeSet<UnitId> = self
                .unit_store
                .children_of(id)
                .into_iter()
                .filter(|child| ledger.contains(child))
                .collect();
            if admitted != recorded {
                return Err(InvariantViolation::StoreDivergence(*id).into());
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.ledger.read().contains(id)
    }

    pub fn is_stable(&self, id: &UnitId) -> bool {
        self.ledger
            .read()
            .status(id)
            .map(|s| s.is_stable)
            .unwrap_or(false)
    }

    pub fn main_chain_index_of(&self, id: &UnitId) -> Option<u64> {
        self.ledger.read().status(id).and_then(|s| s.main_chain_index)
    }

    /// `None` for units that are not admitted
    pub fn witnessed_level_of(&self, id: &UnitId) -> Option<u64> {
        self.ledger.read().node(id).map(|n| n.witnessed_level)
    }

    pub fn unit_status(&self, id: &UnitId) -> Option<UnitView> {
        self.ledger.read().view(id)
    }

    pub fn last_stable_mci(&self) -> u64 {
        self.ledger.read().last_stable_mci()
    }

    pub fn main_chain(&self) -> Vec<(u64, UnitId)> {
        self.ledger.read().main_chain()
    }

    /// Current main-chain top unit
    pub fn tip(&self) -> Option<UnitId> {
        let ledger = self.ledger.read();
        ledger
            .main_chain_top()
            .and_then(|mci| ledger.main_chain_unit(mci))
    }

    pub fn stats(&self) -> ConsensusStats {
        self.ledger.read().stats()
    }

    /// True when no writer holds the ledger
    pub fn writer_idle(&self) -> bool {
        self.ledger.try_upgradable_read().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StabilizedUnit> {
        self.events.subscribe()
    }
}
