//! Main-chain rebuild
//!
//! Phase 1 clears every index above the fork point, phase 2 assigns the new
//! path consecutive indexes upward from it. Both phases write into the staged
//! delta only.

use crate::error::{ConsensusResult, InvariantViolation};
use crate::graph::{GraphView, Staged};
use crate::main_chain::{path_to_main_chain, select_tip};
use crate::types::{ConsensusConfig, UnitId};

/// What a rebuild changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorgOutcome {
    pub fork_mci: u64,
    /// Indexes whose previous unit left the main chain
    pub cleared: Vec<(u64, UnitId)>,
    pub assigned: Vec<(u64, UnitId)>,
}

impl ReorgOutcome {
    /// True when existing main-chain units were displaced
    pub fn is_reorg(&self) -> bool {
        !self.cleared.is_empty()
    }
}

/// Recompute the tip and rewrite main-chain membership above the fork
pub fn rebuild_main_chain(
    staged: &mut Staged<'_>,
    config: &ConsensusConfig,
) -> ConsensusResult<ReorgOutcome> {
    let tip = select_tip(staged, config.max_traversal)?;
    let route = path_to_main_chain(staged, &tip, config.max_traversal)?;
    let last_stable_mci = staged.last_stable_mci();
    let top = staged.main_chain_top().unwrap_or(route.fork_mci);

    let mut outcome = ReorgOutcome {
        fork_mci: route.fork_mci,
        ..Default::default()
    };

    for mci in (route.fork_mci + 1)..=top {
        if mci <= last_stable_mci {
            return Err(InvariantViolation::ReorgBelowStablePoint {
                fork_mci: route.fork_mci,
                last_stable_mci,
            }
            .into());
        }
        let id = staged
            .main_chain_unit(mci)
            .ok_or(InvariantViolation::MissingMainChainUnit(mci))?;
        let mut status = staged
            .status(&id)
            .ok_or(InvariantViolation::MissingUnit(id))?;
        if status.is_stable {
            return Err(InvariantViolation::ReorgBelowStablePoint {
                fork_mci: route.fork_mci,
                last_stable_mci,
            }
            .into());
        }
        status.is_on_main_chain = false;
        status.main_chain_index = None;
        staged.set_status(id, status);
        staged.clear_main_chain(mci);
        outcome.cleared.push((mci, id));
    }

    for (offset, id) in route.path.iter().enumerate() {
        let mci = route.fork_mci + 1 + offset as u64;
        let mut status = staged
            .status(id)
            .ok_or(InvariantViolation::MissingUnit(*id))?;
        status.is_on_main_chain = true;
        status.main_chain_index = Some(mci);
        staged.set_status(*id, status);
        staged.assign_main_chain(mci, *id);
        outcome.assigned.push((mci, *id));
    }
    staged.set_main_chain_top(Some(route.fork_mci + route.path.len() as u64));

    if outcome.is_reorg() {
        staged.record_reorg();
        tracing::info!(
            "Main chain reorganized at MCI {}: {} cleared, {} assigned, tip {}",
            route.fork_mci,
            outcome.cleared.len(),
            outcome.assigned.len(),
            tip.id.short()
        );
    } else if !outcome.assigned.is_empty() {
        tracing::debug!(
            "Main chain extended to MCI {} (tip {})",
            route.fork_mci + route.path.len() as u64,
            tip.id.short()
        );
    }

    Ok(outcome)
}
