//! Best-parent ordering
//!
//! One total order ranks parents and tip candidates alike:
//! 1. higher witnessed level
//! 2. lower level, then lower levels along both best-parent chains until they
//!    converge or run out
//! 3. smaller unit id

use crate::error::{ConsensusResult, InvariantViolation};
use crate::graph::{best_parent_of, require_node, GraphView};
use crate::types::{UnitId, UnitNode};
use std::cmp::Ordering;
use std::sync::Arc;

/// Compare two candidates; `Ordering::Less` means `a` ranks ahead of `b`
pub fn compare<V: GraphView + ?Sized>(
    view: &V,
    a: &Arc<UnitNode>,
    b: &Arc<UnitNode>,
    limit: usize,
) -> ConsensusResult<Ordering> {
    if a.id == b.id {
        return Ok(Ordering::Equal);
    }

    let by_witnessed = b.witnessed_level.cmp(&a.witnessed_level);
    if by_witnessed != Ordering::Equal {
        return Ok(by_witnessed);
    }

    let by_level = a.level.cmp(&b.level);
    if by_level != Ordering::Equal {
        return Ok(by_level);
    }

    let mut left = best_parent_of(view, a)?;
    let mut right = best_parent_of(view, b)?;
    let mut steps = 0usize;
    loop {
        let (l, r) = match (&left, &right) {
            (Some(l), Some(r)) if l.id != r.id => (l.clone(), r.clone()),
            _ => break,
        };
        let by_level = l.level.cmp(&r.level);
        if by_level != Ordering::Equal {
            return Ok(by_level);
        }
        steps += 1;
        if steps > limit {
            return Err(InvariantViolation::TraversalLimit { limit }.into());
        }
        left = best_parent_of(view, &l)?;
        right = best_parent_of(view, &r)?;
    }

    Ok(a.id.cmp(&b.id))
}

/// The best of `candidates`, or `None` if there are none
pub fn select_best<V, I>(view: &V, candidates: I, limit: usize) -> ConsensusResult<Option<Arc<UnitNode>>>
where
    V: GraphView + ?Sized,
    I: IntoIterator<Item = Arc<UnitNode>>,
{
    let mut best: Option<Arc<UnitNode>> = None;
    for candidate in candidates {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                if compare(view, &candidate, &current, limit)? == Ordering::Less {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }
    Ok(best)
}

/// Best parent among admitted `parents`
pub fn select_best_parent<V: GraphView + ?Sized>(
    view: &V,
    parents: &[UnitId],
    limit: usize,
) -> ConsensusResult<Option<UnitId>> {
    let nodes = parents
        .iter()
        .map(|id| require_node(view, id))
        .collect::<ConsensusResult<Vec<_>>>()?;
    Ok(select_best(view, nodes, limit)?.map(|node| node.id))
}
