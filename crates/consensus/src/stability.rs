//! Stability oracle
//!
//! The candidate is always the main-chain unit right above the last stable
//! one. Walking down the main chain from its top, the oracle collects
//! witness-authored units until a majority of distinct witnesses has been
//! seen. The candidate becomes stable when the lowest witnessed level among
//! those units exceeds every level an alternative branch has reached.

use crate::error::{ConsensusResult, InvariantViolation};
use crate::events::SequenceResolver;
use crate::graph::{best_parent_of, require_node, unstable_ancestors, GraphView, Staged};
use crate::main_chain::{best_children_closure, last_stable_unit};
use crate::types::{Address, ConsensusConfig, LegacyWitnessRule, Sequence, UnitId};
use std::collections::BTreeSet;

/// Result of evaluating one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityVerdict {
    pub unit: UnitId,
    pub mci: u64,
    pub stable: bool,
    /// Lowest witnessed level among the counted main-chain units
    pub min_mc_wl: Option<u64>,
    pub max_alt_level: u64,
    /// Main-chain units above the candidate that brought in a new witness,
    /// highest first
    pub later_units: Vec<UnitId>,
    pub alt_units: Vec<UnitId>,
}

impl StabilityVerdict {
    fn unstable(unit: UnitId, mci: u64) -> Self {
        Self {
            unit,
            mci,
            stable: false,
            min_mc_wl: None,
            max_alt_level: 0,
            later_units: Vec::new(),
            alt_units: Vec::new(),
        }
    }
}

/// Evaluate the main-chain unit at `mci`
pub fn evaluate<V: GraphView + ?Sized>(
    view: &V,
    mci: u64,
    config: &ConsensusConfig,
) -> ConsensusResult<StabilityVerdict> {
    let limit = config.max_traversal;
    let id = view
        .main_chain_unit(mci)
        .ok_or(InvariantViolation::MissingMainChainUnit(mci))?;
    let unit = require_node(view, &id)?;
    let status = view.status(&id).ok_or(InvariantViolation::MissingUnit(id))?;
    let top = match view.main_chain_top() {
        Some(top) if top > mci => top,
        _ => return Ok(StabilityVerdict::unstable(id, mci)),
    };
    if view.is_free(&id) || status.main_chain_index.is_none() {
        return Ok(StabilityVerdict::unstable(id, mci));
    }

    let reference = last_stable_unit(view)?;
    let witnesses = &reference.witness_list;
    let mut collected: BTreeSet<Address> = BTreeSet::new();
    let mut later_units = Vec::new();
    let mut min_mc_wl: Option<u64> = None;
    for later_mci in (mci + 1..=top).rev() {
        let later_id = view
            .main_chain_unit(later_mci)
            .ok_or(InvariantViolation::MissingMainChainUnit(later_mci))?;
        let later = require_node(view, &later_id)?;
        let mutations = later.witness_list.mutations_from(witnesses);
        if mutations > config.max_witness_list_mutations {
            match config.legacy_witness_rule {
                LegacyWitnessRule::Exclude => {
                    tracing::warn!(
                        "Ignoring main-chain unit {} with {} witness-list mutations",
                        later_id.short(),
                        mutations
                    );
                    continue;
                }
                LegacyWitnessRule::Reject => {
                    return Err(InvariantViolation::IncompatibleWitnessList {
                        unit: later_id,
                        mutations,
                    }
                    .into());
                }
            }
        }

        let mut contributed = false;
        for author in &later.authors {
            if witnesses.contains(author) && collected.insert(author.clone()) {
                contributed = true;
            }
        }
        if contributed {
            min_mc_wl = Some(match min_mc_wl {
                Some(current) => current.min(later.witnessed_level),
                None => later.witnessed_level,
            });
            later_units.push(later_id);
        }
        if collected.len() >= config.majority {
            break;
        }
    }

    let min_wl = match min_mc_wl {
        Some(wl) if collected.len() >= config.majority => wl,
        _ => return Ok(StabilityVerdict::unstable(id, mci)),
    };

    let alt_roots: Vec<UnitId> = match best_parent_of(view, &unit)? {
        Some(parent) => view
            .best_children(&parent.id)
            .into_iter()
            .filter(|child| *child != id)
            .collect(),
        None => Vec::new(),
    };
    let alternatives = best_children_closure(view, &alt_roots, limit)?;
    let max_alt_level = alternatives
        .iter()
        .map(|node| node.level)
        .fold(unit.level, u64::max);

    Ok(StabilityVerdict {
        unit: id,
        mci,
        stable: min_wl > max_alt_level,
        min_mc_wl: Some(min_wl),
        max_alt_level,
        later_units,
        alt_units: alternatives.iter().map(|node| node.id).collect(),
    })
}

/// Mark the main-chain unit at `mci` and its unstable ancestors stable
///
/// Returns the units stabilized, in (level, id) order.
pub fn stabilize(
    staged: &mut Staged<'_>,
    mci: u64,
    resolver: &dyn SequenceResolver,
    config: &ConsensusConfig,
) -> ConsensusResult<Vec<UnitId>> {
    let current = staged.last_stable_mci();
    if mci != current + 1 {
        return Err(InvariantViolation::NonIncreasingStableMci {
            current,
            proposed: mci,
        }
        .into());
    }
    let id = staged
        .main_chain_unit(mci)
        .ok_or(InvariantViolation::MissingMainChainUnit(mci))?;
    let unit = require_node(staged, &id)?;

    let newly_stable = unstable_ancestors(staged, &unit, config.max_traversal)?;
    let mut stabilized = Vec::with_capacity(newly_stable.len());
    for node in newly_stable {
        let mut status = staged
            .status(&node.id)
            .ok_or(InvariantViolation::MissingUnit(node.id))?;
        status.is_stable = true;
        status.stabilized_at_mci = Some(mci);
        if status.sequence == Sequence::TempBad {
            status.sequence = match resolver.resolve(&node, mci) {
                Sequence::TempBad => Sequence::FinalBad,
                resolved => resolved,
            };
        }
        staged.push_notification(node.id, mci, &status);
        staged.set_status(node.id, status);
        stabilized.push(node.id);
    }
    staged.set_last_stable_mci(mci);

    tracing::info!(
        "Stabilized MCI {} ({}), {} units final",
        mci,
        id.short(),
        stabilized.len()
    );
    Ok(stabilized)
}

/// Advance stability for as many consecutive MCIs as qualify
pub fn advance_stability(
    staged: &mut Staged<'_>,
    resolver: &dyn SequenceResolver,
    config: &ConsensusConfig,
) -> ConsensusResult<Vec<StabilityVerdict>> {
    let mut advanced = Vec::new();
    loop {
        let next = staged.last_stable_mci() + 1;
        match staged.main_chain_top() {
            Some(top) if next <= top => {}
            _ => break,
        }
        let verdict = evaluate(staged, next, config)?;
        if !verdict.stable {
            tracing::debug!(
                "MCI {} not yet stable (min_mc_wl {:?}, max_alt_level {})",
                next,
                verdict.min_mc_wl,
                verdict.max_alt_level
            );
            break;
        }
        stabilize(staged, next, resolver, config)?;
        advanced.push(verdict);
    }
    Ok(advanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsensusError;
    use crate::events::FinalBadResolver;
    use crate::graph::testing::*;
    use crate::types::{Address, Sequence, UnitStatus, WitnessList};

    fn config() -> ConsensusConfig {
        ConsensusConfig::default()
    }

    /// g <- m1 <- m2 <- w1 .. w7, with alternative branch g <- y1 <- y2
    ///
    /// w1..w7 are authored by W01..W07; `wls[i]` is the witnessed level of w(i+1).
    fn candidate_graph_with(wls: [u64; 7]) -> Sketch {
        let mut g = Sketch::new();
        g.add("g", &[], witness(1), 0, 0, None);
        g.add("m1", &["g"], "x".into(), 1, 0, Some("g"));
        g.add("m2", &["m1"], "x".into(), 2, 0, Some("m1"));
        g.add("y1", &["g"], "y".into(), 1, 0, Some("g"));
        g.add("y2", &["y1"], "y".into(), 2, 0, Some("y1"));
        g.put_on_main_chain("g", 0, true);
        g.put_on_main_chain("m1", 1, false);
        g.put_on_main_chain("m2", 2, false);
        let mut prev = "m2".to_string();
        for (i, wl) in (1..=7u64).zip(wls) {
            let name = format!("w{}", i);
            g.add(&name, &[prev.as_str()], witness(i as usize), 2 + i, wl, Some(prev.as_str()));
            g.put_on_main_chain(&name, 2 + i, false);
            prev = name;
        }
        g
    }

    fn candidate_graph(wl: u64) -> Sketch {
        candidate_graph_with([wl; 7])
    }

    fn counted() -> Vec<UnitId> {
        (1..=7).rev().map(|i| id(&format!("w{}", i))).collect()
    }

    #[test]
    fn test_alternative_branch_blocks_stability() {
        let g = candidate_graph(2);
        let verdict = evaluate(&g.ledger, 1, &config()).unwrap();
        assert_eq!(verdict.min_mc_wl, Some(2));
        assert_eq!(verdict.max_alt_level, 2);
        assert!(!verdict.stable);
        let mut alt = verdict.alt_units.clone();
        alt.sort();
        let mut expected = vec![id("y1"), id("y2")];
        expected.sort();
        assert_eq!(alt, expected);
    }

    #[test]
    fn test_witnessed_level_above_alternatives_is_stable() {
        let g = candidate_graph(3);
        let verdict = evaluate(&g.ledger, 1, &config()).unwrap();
        assert!(verdict.stable);
        assert_eq!(verdict.min_mc_wl, Some(3));
        assert_eq!(verdict.later_units, counted());
    }

    #[test]
    fn test_free_candidate_is_not_stable() {
        let g = candidate_graph(3);
        let verdict = evaluate(&g.ledger, 9, &config()).unwrap();
        assert!(!verdict.stable);
        assert_eq!(verdict.min_mc_wl, None);
    }

    #[test]
    fn test_needs_majority_of_witnesses_above_candidate() {
        // Only w2..w7 sit above w1: six witnesses
        let g = candidate_graph(9);
        let verdict = evaluate(&g.ledger, 3, &config()).unwrap();
        assert_eq!(verdict.unit, id("w1"));
        assert!(!verdict.stable);
        assert_eq!(verdict.min_mc_wl, None);
    }

    #[test]
    fn test_single_high_tip_is_not_enough() {
        let mut g = Sketch::new();
        g.add("g", &[], witness(1), 0, 0, None);
        g.add("m1", &["g"], "x".into(), 1, 0, Some("g"));
        g.add("m2", &["m1"], "x".into(), 2, 0, Some("m1"));
        g.add("top", &["m2"], witness(2), 3, 10, Some("m2"));
        g.put_on_main_chain("g", 0, true);
        g.put_on_main_chain("m1", 1, false);
        g.put_on_main_chain("m2", 2, false);
        g.put_on_main_chain("top", 3, false);

        let verdict = evaluate(&g.ledger, 1, &config()).unwrap();
        assert!(!verdict.stable);
        assert_eq!(verdict.min_mc_wl, None);
    }

    #[test]
    fn test_lowest_counted_unit_sets_min_mc_wl() {
        let g = candidate_graph_with([5, 5, 5, 1, 5, 5, 5]);
        let verdict = evaluate(&g.ledger, 1, &config()).unwrap();
        assert_eq!(verdict.min_mc_wl, Some(1));
        assert_eq!(verdict.max_alt_level, 2);
        assert!(!verdict.stable);
    }

    #[test]
    fn test_sibling_of_candidate_counts_as_alternative() {
        let mut g = candidate_graph(3);
        g.add("m1b", &["m1"], "x".into(), 2, 0, Some("m1"));
        let verdict = evaluate(&g.ledger, 2, &config()).unwrap();
        assert_eq!(verdict.unit, id("m2"));
        assert!(verdict.stable);
        assert!(verdict.alt_units.contains(&id("m1b")));

        // Drop the witnessed level to the candidate's own level
        let g = candidate_graph(1);
        assert!(!evaluate(&g.ledger, 1, &config()).unwrap().stable);
    }

    #[test]
    fn test_incompatible_main_chain_units() {
        let g = candidate_graph(3);
        let mut drifted: Vec<Address> = (3..=12).map(witness).collect();
        drifted.push("new-a".into());
        drifted.push("new-b".into());
        let list = WitnessList::new(drifted, 12).unwrap();
        let w7 = id("w7");
        let mut replaced = (*g.ledger.node(&w7).unwrap()).clone();
        replaced.id = id("top-drifted");
        replaced.parents = vec![w7];
        replaced.best_parent = Some(w7);
        replaced.authors = vec![witness(8)];
        replaced.level = 10;
        replaced.witness_list = list;

        let mut staged = Staged::new(&g.ledger);
        staged.insert_node(replaced);
        staged.assign_main_chain(10, id("top-drifted"));
        staged.set_main_chain_top(Some(10));

        // Skipped: the seven witnesses below it still decide
        let verdict = evaluate(&staged, 1, &config()).unwrap();
        assert!(verdict.stable);
        assert_eq!(verdict.later_units, counted());

        let strict = ConsensusConfig {
            legacy_witness_rule: LegacyWitnessRule::Reject,
            ..config()
        };
        let err = evaluate(&staged, 1, &strict).unwrap_err();
        assert_eq!(
            err,
            ConsensusError::Invariant(InvariantViolation::IncompatibleWitnessList {
                unit: id("top-drifted"),
                mutations: 2,
            })
        );
    }

    #[test]
    fn test_advance_stabilizes_in_order() {
        let g = candidate_graph(3);
        let mut staged = Staged::new(&g.ledger);
        let verdicts = advance_stability(&mut staged, &FinalBadResolver, &config()).unwrap();
        // m1 and m2 sit below WL 3; w1 has only six witnesses above it
        assert_eq!(verdicts.iter().map(|v| v.mci).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(staged.last_stable_mci(), 2);

        let notifications = staged.delta().notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].unit, id("m1"));
        assert_eq!(notifications[1].unit, id("m2"));
        assert!(notifications[0].seq < notifications[1].seq);
        assert!(!staged.status(&id("y1")).unwrap().is_stable);
    }

    #[test]
    fn test_stabilize_includes_side_ancestors_and_resolves_temp_bad() {
        let mut g = Sketch::new();
        g.add("g", &[], witness(1), 0, 0, None);
        g.add("side", &["g"], "s".into(), 1, 0, Some("g"));
        g.add("m1", &["g"], "x".into(), 1, 0, Some("g"));
        g.add("m2", &["m1", "side"], "x".into(), 2, 0, Some("m1"));
        g.put_on_main_chain("g", 0, true);
        g.put_on_main_chain("m1", 1, true);
        g.put_on_main_chain("m2", 2, false);
        let flagged = {
            let mut staged = Staged::new(&g.ledger);
            staged.set_status(
                id("side"),
                UnitStatus {
                    sequence: Sequence::TempBad,
                    ..Default::default()
                },
            );
            staged.into_delta()
        };
        g.ledger.apply(flagged);

        let mut staged = Staged::new(&g.ledger);
        let stabilized = stabilize(&mut staged, 2, &FinalBadResolver, &config()).unwrap();
        assert_eq!(stabilized.len(), 2);
        assert_eq!(*stabilized.last().unwrap(), id("m2"));

        let side = staged.status(&id("side")).unwrap();
        assert!(side.is_stable);
        assert!(!side.is_on_main_chain);
        assert_eq!(side.stabilized_at_mci, Some(2));
        assert_eq!(side.sequence, Sequence::FinalBad);
    }

    #[test]
    fn test_stabilize_rejects_skipped_mci() {
        let g = candidate_graph(3);
        let mut staged = Staged::new(&g.ledger);
        let err = stabilize(&mut staged, 2, &FinalBadResolver, &config()).unwrap_err();
        assert_eq!(
            err,
            ConsensusError::Invariant(InvariantViolation::NonIncreasingStableMci {
                current: 0,
                proposed: 2
            })
        );
    }
}
