//! Main-chain tip selection, fork path and best-children closure

use crate::best_parent::select_best;
use crate::error::{ConsensusResult, InvariantViolation};
use crate::graph::{best_parent_of, passes_through, require_node, GraphView};
use crate::types::{UnitId, UnitNode};
use std::collections::HashSet;
use std::sync::Arc;

/// Route from the current main chain up to a new tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainChainPath {
    pub tip: UnitId,
    /// Highest unit of the current main chain on the route
    pub fork_unit: UnitId,
    pub fork_mci: u64,
    /// Units above the fork, lowest first
    pub path: Vec<UnitId>,
}

/// The last stable main-chain unit
pub fn last_stable_unit<V: GraphView + ?Sized>(view: &V) -> ConsensusResult<Arc<UnitNode>> {
    let mci = view.last_stable_mci();
    let id = view
        .main_chain_unit(mci)
        .ok_or(InvariantViolation::MissingMainChainUnit(mci))?;
    require_node(view, &id)
}

/// Best free unit whose best-parent chain reaches the last stable unit
pub fn select_tip<V: GraphView + ?Sized>(view: &V, limit: usize) -> ConsensusResult<Arc<UnitNode>> {
    let stable = last_stable_unit(view)?;
    let mut eligible = Vec::new();
    for id in view.free_units() {
        let node = require_node(view, &id)?;
        if passes_through(view, &node, &stable, limit)? {
            eligible.push(node);
        }
    }
    select_best(view, eligible, limit)?.ok_or_else(|| InvariantViolation::NoEligibleTip.into())
}

/// Follow best parents from `tip` down to the first main-chain unit
pub fn path_to_main_chain<V: GraphView + ?Sized>(
    view: &V,
    tip: &Arc<UnitNode>,
    limit: usize,
) -> ConsensusResult<MainChainPath> {
    let mut path = Vec::new();
    let mut current = tip.clone();
    let fork_mci = loop {
        let status = view
            .status(&current.id)
            .ok_or(InvariantViolation::MissingUnit(current.id))?;
        if status.is_on_main_chain {
            break status.main_chain_index.ok_or_else(|| {
                InvariantViolation::CorruptLedger(format!(
                    "main-chain unit {} has no index",
                    current.id
                ))
            })?;
        }
        path.push(current.id);
        if path.len() > limit {
            return Err(InvariantViolation::TraversalLimit { limit }.into());
        }
        current = best_parent_of(view, &current)?.ok_or_else(|| {
            InvariantViolation::CorruptLedger(format!(
                "best-parent chain of {} ends off the main chain",
                tip.id
            ))
        })?;
    };

    let last_stable_mci = view.last_stable_mci();
    if fork_mci < last_stable_mci {
        return Err(InvariantViolation::ReorgBelowStablePoint {
            fork_mci,
            last_stable_mci,
        }
        .into());
    }

    path.reverse();
    Ok(MainChainPath {
        tip: tip.id,
        fork_unit: current.id,
        fork_mci,
        path,
    })
}

/// Units reachable from `roots` along best-child edges, roots included
pub fn best_children_closure<V: GraphView + ?Sized>(
    view: &V,
    roots: &[UnitId],
    limit: usize,
) -> ConsensusResult<Vec<Arc<UnitNode>>> {
    let mut visited: HashSet<UnitId> = HashSet::new();
    let mut worklist: Vec<UnitId> = Vec::new();
    let mut closure = Vec::new();

    for root in roots {
        if visited.insert(*root) {
            worklist.push(*root);
        }
    }
    while let Some(id) = worklist.pop() {
        if closure.len() >= limit {
            return Err(InvariantViolation::TraversalLimit { limit }.into());
        }
        closure.push(require_node(view, &id)?);
        for child in view.best_children(&id) {
            if visited.insert(child) {
                worklist.push(child);
            }
        }
    }

    Ok(closure)
}
