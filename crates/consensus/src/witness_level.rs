//! Witnessed level computation
//!
//! Walks ancestors from the unit downward in (level, id) order and stops at
//! the unit that brings in the majority-th distinct witness of the unit's own
//! witness list. That unit's level is the witnessed level.

use crate::error::{ConsensusResult, InvariantViolation};
use crate::graph::{checked_parent, require_node, GraphView};
use crate::types::{Address, ConsensusConfig, UnitId, UnitNode};
use std::collections::{BTreeSet, BinaryHeap, HashSet};

/// Witnessed level of `unit`, which need not be admitted yet
///
/// Returns 0 when fewer than `config.majority` witnesses appear among the
/// unit and its ancestors.
pub fn witnessed_level<V: GraphView + ?Sized>(
    view: &V,
    unit: &UnitNode,
    config: &ConsensusConfig,
) -> ConsensusResult<u64> {
    let witnesses = &unit.witness_list;
    let mut found: BTreeSet<Address> = BTreeSet::new();

    for author in &unit.authors {
        if witnesses.contains(author) {
            found.insert(author.clone());
        }
    }
    if found.len() >= config.majority {
        return Ok(unit.level);
    }

    let mut heap: BinaryHeap<(u64, UnitId)> = BinaryHeap::new();
    let mut visited: HashSet<UnitId> = HashSet::new();
    for parent in &unit.parents {
        if visited.insert(*parent) {
            let node = checked_parent(view, unit, parent)?;
            heap.push((node.level, node.id));
        }
    }

    while let Some((level, id)) = heap.pop() {
        let node = require_node(view, &id)?;
        for author in &node.authors {
            if witnesses.contains(author) {
                found.insert(author.clone());
            }
        }
        if found.len() >= config.majority {
            return Ok(level);
        }

        for parent in &node.parents {
            let parent_node = checked_parent(view, &node, parent)?;
            if visited.insert(*parent) {
                if visited.len() > config.max_traversal {
                    return Err(InvariantViolation::TraversalLimit {
                        limit: config.max_traversal,
                    }
                    .into());
                }
                heap.push((parent_node.level, parent_node.id));
            }
        }
    }

    Ok(0)
}
