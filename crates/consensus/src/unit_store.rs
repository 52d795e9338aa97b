//! Unit store contract and an in-memory implementation using DashMap

use crate::error::StructuralError;
use crate::types::{Address, Sequence, Unit, UnitId, UnitMeta, WitnessList, WitnessListRef};
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Read access to recorded units
///
/// Units are recorded here after structural validation; the consensus core
/// admits them separately.
pub trait UnitStore: Send + Sync {
    fn get_unit(&self, id: &UnitId) -> Option<UnitMeta>;

    /// Units no recorded unit lists as a parent
    fn get_free_units(&self) -> BTreeSet<UnitId>;

    fn children_of(&self, id: &UnitId) -> BTreeSet<UnitId>;
}

/// Thread-safe in-memory unit store
///
/// Recording runs concurrently from ingest tasks; reads are lock-free.
#[derive(Clone)]
pub struct MemoryUnitStore {
    units: Arc<DashMap<UnitId, UnitMeta>>,
    children: Arc<DashMap<UnitId, BTreeSet<UnitId>>>,
    free: Arc<DashSet<UnitId>>,
    witness_count: usize,
}

impl Default for MemoryUnitStore {
    fn default() -> Self {
        Self::with_witness_count(crate::COUNT_WITNESSES)
    }
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store expecting inline witness lists of `witness_count` addresses
    pub fn with_witness_count(witness_count: usize) -> Self {
        Self {
            units: Arc::default(),
            children: Arc::default(),
            free: Arc::default(),
            witness_count,
        }
    }

    /// Validate and record a unit, computing its level
    pub fn insert(&self, unit: Unit) -> Result<UnitMeta, StructuralError> {
        let meta = self.validate(unit)?;
        self.publish(meta.clone());
        Ok(meta)
    }

    /// Structural checks and level derivation, without recording anything
    pub fn validate(&self, unit: Unit) -> Result<UnitMeta, StructuralError> {
        if !unit.has_valid_id() {
            return Err(StructuralError::InvalidId);
        }
        self.check(unit.id, unit.parents, unit.authors, unit.witness_list, unit.sequence, None)
    }

    /// Record a unit restored from disk, checking its stored level
    pub fn restore(&self, meta: UnitMeta) -> Result<UnitMeta, StructuralError> {
        let meta = self.check(
            meta.id,
            meta.parents,
            meta.authors,
            meta.witness_list,
            meta.sequence,
            Some(meta.level),
        )?;
        self.publish(meta.clone());
        Ok(meta)
    }

    fn check(
        &self,
        id: UnitId,
        parents: Vec<UnitId>,
        authors: Vec<Address>,
        witness_list: WitnessListRef,
        sequence: Sequence,
        declared_level: Option<u64>,
    ) -> Result<UnitMeta, StructuralError> {
        if self.units.contains_key(&id) {
            return Err(StructuralError::DuplicateUnit(id));
        }
        if authors.is_empty() {
            return Err(StructuralError::NoAuthors);
        }
        if let WitnessListRef::Inline(addresses) = &witness_list {
            WitnessList::new(addresses.clone(), self.witness_count)?;
        }
        let mut seen = BTreeSet::new();
        for parent in &parents {
            if !seen.insert(*parent) {
                return Err(StructuralError::DuplicateParent(*parent));
            }
        }

        let level = if parents.is_empty() {
            if !self.units.is_empty() {
                return Err(StructuralError::GenesisAlreadyExists);
            }
            0
        } else {
            let mut max_parent = 0;
            for parent in &parents {
                let parent_level = self
                    .units
                    .get(parent)
                    .map(|p| p.level)
                    .ok_or(StructuralError::UnknownParent(*parent))?;
                max_parent = max_parent.max(parent_level);
            }
            max_parent + 1
        };
        if let Some(declared) = declared_level {
            if declared != level {
                return Err(StructuralError::LevelMismatch {
                    declared,
                    computed: level,
                });
            }
        }

        Ok(UnitMeta {
            id,
            parents,
            authors,
            level,
            witness_list,
            sequence,
        })
    }

    /// Make a validated unit visible to readers
    pub fn publish(&self, meta: UnitMeta) {
        let id = meta.id;
        // Mark free before publishing so a concurrent child can clear it
        self.free.insert(id);
        self.units.insert(id, meta.clone());
        for parent in &meta.parents {
            self.children.entry(*parent).or_default().insert(id);
            self.free.remove(parent);
        }
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All recorded units in level order
    pub fn all_units(&self) -> Vec<UnitMeta> {
        let mut units: Vec<UnitMeta> = self.units.iter().map(|r| r.value().clone()).collect();
        units.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
        units
    }
}

impl UnitStore for MemoryUnitStore {
    fn get_unit(&self, id: &UnitId) -> Option<UnitMeta> {
        self.units.get(id).map(|r| r.value().clone())
    }

    fn get_free_units(&self) -> BTreeSet<UnitId> {
        self.free.iter().map(|r| *r.key()).collect()
    }

    fn children_of(&self, id: &UnitId) -> BTreeSet<UnitId> {
        self.children.get(id).map(|r| r.value().clone()).unwrap_or_default()
    }
}
