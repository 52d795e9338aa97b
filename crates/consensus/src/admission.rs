//! Structural checks and derived fields for a unit entering the ledger

use crate::best_parent::select_best_parent;
use crate::error::{ConsensusResult, StructuralError};
use crate::graph::{GraphView, Staged};
use crate::types::{ConsensusConfig, UnitMeta, UnitNode, WitnessList, WitnessListRef};
use crate::unit_store::UnitStore;
use crate::witness_level::witnessed_level;
use std::collections::BTreeSet;

/// Validate `meta` against the staged ledger and derive its admitted form
pub fn prepare_unit(
    staged: &Staged<'_>,
    unit_store: &dyn UnitStore,
    meta: &UnitMeta,
    config: &ConsensusConfig,
) -> ConsensusResult<UnitNode> {
    if staged.contains(&meta.id) {
        return Err(StructuralError::DuplicateUnit(meta.id).into());
    }
    if meta.authors.is_empty() {
        return Err(StructuralError::NoAuthors.into());
    }

    let level = if meta.parents.is_empty() {
        if !staged.is_empty() {
            return Err(StructuralError::GenesisAlreadyExists.into());
        }
        0
    } else {
        let mut seen = BTreeSet::new();
        let mut max_parent = 0;
        for parent in &meta.parents {
            if !seen.insert(*parent) {
                return Err(StructuralError::DuplicateParent(*parent).into());
            }
            let node = staged
                .node(parent)
                .ok_or(StructuralError::UnknownParent(*parent))?;
            max_parent = max_parent.max(node.level);
        }
        max_parent + 1
    };
    if meta.level != level {
        return Err(StructuralError::LevelMismatch {
            declared: meta.level,
            computed: level,
        }
        .into());
    }

    let witness_list = resolve_witness_list(staged, unit_store, &meta.witness_list, config)?;
    let best_parent = select_best_parent(staged, &meta.parents, config.max_traversal)?;

    let mut node = UnitNode {
        id: meta.id,
        parents: meta.parents.clone(),
        authors: meta.authors.clone(),
        level,
        witnessed_level: 0,
        best_parent,
        witness_list,
        declared_sequence: meta.sequence,
    };
    node.witnessed_level = witnessed_level(staged, &node, config)?;
    Ok(node)
}

fn resolve_witness_list(
    staged: &Staged<'_>,
    unit_store: &dyn UnitStore,
    reference: &WitnessListRef,
    config: &ConsensusConfig,
) -> ConsensusResult<WitnessList> {
    match reference {
        WitnessListRef::Inline(addresses) => {
            Ok(WitnessList::new(addresses.clone(), config.witness_count)?)
        }
        WitnessListRef::SameAs(source) => {
            let node = staged
                .node(source)
                .ok_or(StructuralError::UnknownWitnessListUnit(*source))?;
            let carries_inline = unit_store
                .get_unit(source)
                .map(|meta| matches!(meta.witness_list, WitnessListRef::Inline(_)))
                .unwrap_or(false);
            if !carries_inline {
                return Err(StructuralError::WitnessListUnitNotInline(*source).into());
            }
            Ok(node.witness_list.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsensusError;
    use crate::graph::Ledger;
    use crate::types::{Address, Sequence, Unit, UnitId};
    use crate::unit_store::MemoryUnitStore;

    fn witnesses() -> Vec<Address> {
        (1..=12).map(|i| Address::new(format!("W{:02}", i))).collect()
    }

    fn meta_of(store: &MemoryUnitStore, unit: Unit) -> UnitMeta {
        store.insert(unit).unwrap()
    }

    /// Ledger holding just the genesis unit
    fn with_genesis(store: &MemoryUnitStore) -> (Ledger, UnitId) {
        let genesis = Unit::new(
            vec![],
            vec!["W01".into()],
            WitnessListRef::Inline(witnesses()),
            Sequence::Good,
            0,
        );
        let meta = meta_of(store, genesis);
        let mut ledger = Ledger::new();
        let delta = {
            let mut staged = Staged::new(&ledger);
            let node = prepare_unit(&staged, store, &meta, &ConsensusConfig::default()).unwrap();
            staged.insert_node(node);
            staged.into_delta()
        };
        ledger.apply(delta);
        (ledger, meta.id)
    }

    #[test]
    fn test_prepare_genesis_and_child() {
        let store = MemoryUnitStore::new();
        let (ledger, genesis) = with_genesis(&store);
        let child = meta_of(
            &store,
            Unit::new(vec![genesis], vec!["W02".into()], WitnessListRef::SameAs(genesis), Sequence::Good, 1),
        );
        let staged = Staged::new(&ledger);
        let node = prepare_unit(&staged, &store, &child, &ConsensusConfig::default()).unwrap();
        assert_eq!(node.level, 1);
        assert_eq!(node.best_parent, Some(genesis));
        assert_eq!(node.witnessed_level, 0);
        assert_eq!(node.witness_list.len(), 12);
    }

    #[test]
    fn test_prepare_rejects_structural_problems() {
        let store = MemoryUnitStore::new();
        let (ledger, genesis) = with_genesis(&store);
        let staged = Staged::new(&ledger);
        let config = ConsensusConfig::default();

        let genesis_meta = store.get_unit(&genesis).unwrap();
        assert_eq!(
            prepare_unit(&staged, &store, &genesis_meta, &config).unwrap_err(),
            ConsensusError::Structural(StructuralError::DuplicateUnit(genesis))
        );

        let mut short_list = witnesses();
        short_list.pop();
        // The unit store refuses such a list; build the record by hand
        let bad_list = UnitMeta {
            id: UnitId([5u8; 32]),
            parents: vec![genesis],
            authors: vec!["a".into()],
            level: 1,
            witness_list: WitnessListRef::Inline(short_list),
            sequence: Sequence::Good,
        };
        assert!(matches!(
            prepare_unit(&staged, &store, &bad_list, &config).unwrap_err(),
            ConsensusError::Structural(StructuralError::InvalidWitnessList { .. })
        ));

        let unknown_source = UnitId([3u8; 32]);
        let dangling = meta_of(
            &store,
            Unit::new(vec![genesis], vec!["b".into()], WitnessListRef::SameAs(unknown_source), Sequence::Good, 3),
        );
        assert_eq!(
            prepare_unit(&staged, &store, &dangling, &config).unwrap_err(),
            ConsensusError::Structural(StructuralError::UnknownWitnessListUnit(unknown_source))
        );

        let mut wrong_level = meta_of(
            &store,
            Unit::new(vec![genesis], vec!["c".into()], WitnessListRef::SameAs(genesis), Sequence::Good, 4),
        );
        wrong_level.level = 7;
        assert_eq!(
            prepare_unit(&staged, &store, &wrong_level, &config).unwrap_err(),
            ConsensusError::Structural(StructuralError::LevelMismatch {
                declared: 7,
                computed: 1
            })
        );
    }

    #[test]
    fn test_same_as_requires_inline_source() {
        let store = MemoryUnitStore::new();
        let (mut ledger, genesis) = with_genesis(&store);
        let config = ConsensusConfig::default();
        let referencing = meta_of(
            &store,
            Unit::new(vec![genesis], vec!["a".into()], WitnessListRef::SameAs(genesis), Sequence::Good, 1),
        );
        let delta = {
            let mut staged = Staged::new(&ledger);
            let node = prepare_unit(&staged, &store, &referencing, &config).unwrap();
            staged.insert_node(node);
            staged.into_delta()
        };
        ledger.apply(delta);

        let chained = meta_of(
            &store,
            Unit::new(vec![referencing.id], vec!["b".into()], WitnessListRef::SameAs(referencing.id), Sequence::Good, 2),
        );
        let staged = Staged::new(&ledger);
        assert_eq!(
            prepare_unit(&staged, &store, &chained, &config).unwrap_err(),
            ConsensusError::Structural(StructuralError::WitnessListUnitNotInline(referencing.id))
        );
    }
}
