//! End-to-end main chain and stability scenarios over the in-memory stores

mod common;

use common::{cycling_witness, witness, Harness};
use dag_consensus::{Address, ConsensusError, Sequence, StabilityListener, StructuralError, UnitId};
use parking_lot::Mutex;
use std::sync::Arc;

fn anyone(name: &str) -> Address {
    Address::new(name)
}

/// Twenty units: branch Y (y1..y6) and branch X (x1..x6, then a7..a10).
/// Eight distinct witnesses sign from level 6 upward; a10 is co-signed by
/// W01..W07 and so witnesses its own level.
fn twenty_unit_dag() -> Harness {
    let mut h = Harness::new();
    h.genesis(witness(1));

    let mut prev = "G".to_string();
    for i in 1..=6 {
        let name = format!("y{}", i);
        h.unit(&name, &[&prev], anyone("yuri"));
        prev = name;
    }

    let mut prev = "G".to_string();
    for i in 1..=5 {
        let name = format!("x{}", i);
        h.unit(&name, &[&prev], anyone("xena"));
        prev = name;
    }
    h.unit("x6", &["x5"], witness(8));

    h.unit("a7", &["x6"], witness(1));
    h.unit("b7", &["x6"], witness(2));
    h.unit("a8", &["a7", "b7"], witness(3));
    h.unit("b8", &["a7", "b7"], witness(4));
    h.unit("a9", &["a8", "b8"], witness(5));
    h.unit("b9", &["a8", "b8"], witness(6));
    h.unit_by("a10", &["a9", "b9"], (1..=7).map(witness).collect());
    h
}

#[test]
fn test_twenty_unit_scenario_stabilizes_branch_x() {
    let h = twenty_unit_dag();
    let c = &h.coordinator;

    assert_eq!(c.stats().units, 20);
    assert_eq!(c.witnessed_level_of(&h.id("a10")), Some(10));
    assert_eq!(c.witnessed_level_of(&h.id("a9")), Some(0));

    // Branch X is final, and so is every main-chain unit below the tip
    assert!(h.is_stable("x5"));
    for i in 1..=6 {
        assert_eq!(h.mci(&format!("x{}", i)), Some(i));
        assert!(h.is_stable(&format!("x{}", i)));
    }
    assert_eq!(c.last_stable_mci(), 9);
    assert!(h.is_stable("a7"));
    assert!(h.is_stable("b7"));
    assert!(!h.is_stable("a10"));
    for i in 1..=6 {
        let name = format!("y{}", i);
        assert!(!h.is_stable(&name));
        assert_eq!(h.mci(&name), None);
    }

    assert_eq!(c.tip(), Some(h.id("a10")));
    assert_eq!(h.mci("a10"), Some(10));
    common::assert_contiguous(&c.main_chain());
}

#[test]
fn test_twenty_unit_scenario_status_views() {
    let h = twenty_unit_dag();
    let view = h.coordinator.unit_status(&h.id("x3")).unwrap();
    assert!(view.status.is_stable);
    assert!(view.status.is_on_main_chain);
    assert_eq!(view.status.stabilized_at_mci, Some(3));
    assert!(!view.is_free);
    assert_eq!(view.level, 3);

    let tip = h.coordinator.unit_status(&h.id("a10")).unwrap();
    assert!(tip.is_free);
    assert!(!tip.status.is_stable);

    assert!(h.coordinator.unit_status(&UnitId([0u8; 32])).is_none());
    assert_eq!(h.coordinator.witnessed_level_of(&UnitId([0u8; 32])), None);
    assert!(!h.coordinator.is_stable(&UnitId([0u8; 32])));
}

/// Two indistinguishable children of genesis, admitted in either order
fn tie_break_run(reverse: bool) -> (Option<UnitId>, UnitId, UnitId) {
    let mut h = Harness::new();
    h.genesis(witness(1));
    let p = h.record("p", &["G"], anyone("p"));
    let q = h.record("q", &["G"], anyone("q"));
    let order = if reverse { [q, p] } else { [p, q] };
    for id in order {
        h.coordinator.add_unit(&id).unwrap();
    }
    (h.coordinator.tip(), p, q)
}

#[test]
fn test_identical_candidates_ordered_by_id() {
    let (tip, p, q) = tie_break_run(false);
    assert_eq!(tip, Some(p.min(q)));
    for _ in 0..3 {
        assert_eq!(tie_break_run(true), (tip, p, q));
        assert_eq!(tie_break_run(false), (tip, p, q));
    }
}

#[test]
fn test_merge_picks_smaller_id_as_best_parent() {
    let mut h = Harness::new();
    h.genesis(witness(1));
    let p = h.unit("p", &["G"], anyone("p"));
    let q = h.unit("q", &["G"], anyone("q"));
    let child = h.unit("r", &["p", "q"], anyone("r"));
    let view = h.coordinator.unit_status(&child).unwrap();
    assert_eq!(view.best_parent, Some(p.min(q)));
    assert_eq!(h.coordinator.tip(), Some(child));
}

#[test]
fn test_genesis_is_stable_at_zero() {
    let mut h = Harness::new();
    let g = h.genesis(witness(1));
    assert_eq!(h.coordinator.main_chain_index_of(&g), Some(0));
    assert!(h.coordinator.is_stable(&g));
    assert_eq!(h.coordinator.last_stable_mci(), 0);
    assert_eq!(h.coordinator.main_chain(), vec![(0, g)]);
}

#[test]
fn test_second_genesis_and_duplicates_rejected() {
    let mut h = Harness::new();
    h.genesis(witness(1));
    let a = h.unit("a", &["G"], anyone("a"));

    let err = h.coordinator.add_unit(&a).unwrap_err();
    assert_eq!(err, ConsensusError::Structural(StructuralError::DuplicateUnit(a)));
    assert!(!err.is_retryable());

    let unknown = UnitId([42u8; 32]);
    assert_eq!(
        h.coordinator.add_unit(&unknown).unwrap_err(),
        ConsensusError::Structural(StructuralError::UnknownUnit(unknown))
    );
    assert!(h.coordinator.writer_idle());
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(UnitId, u64, Sequence)>>);

impl StabilityListener for Recorder {
    fn on_unit_stabilized(&self, unit_id: &UnitId, mci: u64, sequence: Sequence) {
        self.0.lock().push((*unit_id, mci, sequence));
    }
}

#[test]
fn test_listener_sees_each_unit_once_in_mci_order() {
    let recorder = Arc::new(Recorder::default());
    let units = Arc::new(dag_consensus::MemoryUnitStore::new());
    let store = Arc::new(dag_consensus::MemoryStore::new());
    let coordinator = dag_consensus::Coordinator::builder(units.clone(), store.clone())
        .listener(recorder.clone())
        .open()
        .unwrap();

    // Chain G <- u1 ... <- u20 signed by the witnesses in turn; temp-bad
    // side unit s hangs off u1 and is merged back by u3
    let genesis = dag_consensus::Unit::new(
        vec![],
        vec![witness(1)],
        dag_consensus::WitnessListRef::Inline(common::witness_addresses()),
        Sequence::Good,
        0,
    );
    let gid = genesis.id;
    units.insert(genesis).unwrap();
    coordinator.add_unit(&gid).unwrap();

    let mut prev = gid;
    let mut side = None;
    for i in 1..=20u64 {
        let mut parents = vec![prev];
        if i == 3 {
            if let Some(s) = side {
                parents.push(s);
            }
        }
        let unit = dag_consensus::Unit::new(
            parents,
            vec![cycling_witness(i as usize)],
            dag_consensus::WitnessListRef::SameAs(gid),
            Sequence::Good,
            i,
        );
        let id = unit.id;
        units.insert(unit).unwrap();
        coordinator.add_unit(&id).unwrap();
        if i == 1 {
            let s = dag_consensus::Unit::new(
                vec![id],
                vec![Address::new("side")],
                dag_consensus::WitnessListRef::SameAs(gid),
                Sequence::TempBad,
                100,
            );
            let sid = s.id;
            units.insert(s).unwrap();
            coordinator.add_unit(&sid).unwrap();
            side = Some(sid);
        }
        prev = id;
    }

    let seen = recorder.0.lock().clone();
    let mut mcis: Vec<u64> = seen.iter().map(|(_, mci, _)| *mci).collect();
    let sorted = {
        let mut m = mcis.clone();
        m.sort();
        m
    };
    assert_eq!(mcis, sorted, "notifications out of MCI order");
    mcis.dedup();
    assert_eq!(mcis, (0..=7).collect::<Vec<u64>>());
    assert_eq!(coordinator.last_stable_mci(), 7);

    let mut ids: Vec<UnitId> = seen.iter().map(|(id, _, _)| *id).collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total, "a unit was notified twice");
    assert_eq!(total as u64, coordinator.stats().stabilized_units);

    let side = side.unwrap();
    assert!(coordinator.is_stable(&side));
    let (_, mci, sequence) = seen.iter().find(|(id, _, _)| *id == side).unwrap();
    assert_eq!(*sequence, Sequence::FinalBad);
    assert_eq!(
        coordinator.unit_status(&side).unwrap().status.stabilized_at_mci,
        Some(*mci)
    );
}

/// Units c2..c9 and alt1..alt8 for two interleaved branches off genesis
///
/// The c branch climbs from a1 signed by W01..W08. Each alt unit extends
/// the alt branch from b1 and also merges the next c unit.
fn interleaved_units(h: &mut Harness) -> Vec<UnitId> {
    h.genesis(witness(1));
    let mut ids = vec![h.record("a1", &["G"], anyone("a")), h.record("b1", &["G"], anyone("b"))];
    let mut prev = "a1".to_string();
    for k in 2..=9 {
        let name = format!("c{}", k);
        ids.push(h.record(&name, &[&prev], witness(k - 1)));
        prev = name;
    }
    let alt_authors = [1, 2, 3, 9, 10, 11, 12, 4];
    let mut prev = "b1".to_string();
    for (k, author) in (1..=8).zip(alt_authors) {
        let name = format!("alt{}", k);
        let merged = format!("c{}", k + 1);
        ids.push(h.record(&name, &[&prev, &merged], witness(author)));
        prev = name;
    }
    ids
}

#[test]
fn test_nodes_agree_when_branches_interleave() {
    let mut early = Harness::new();
    let mut late = Harness::new();
    interleaved_units(&mut early);
    interleaved_units(&mut late);

    // One node sees c8 and c9 before any alt unit
    let mut early_order = vec!["a1", "b1"];
    early_order.extend(["c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9"]);
    let mut late_order = vec!["a1", "b1", "c2", "c3", "c4", "c5", "c6", "c7"];
    late_order.extend(["alt1", "alt2", "alt3", "alt4", "alt5", "alt6", "c8", "alt7", "c9", "alt8"]);

    for name in &early_order {
        early.coordinator.add_unit(&early.id(name)).unwrap();
    }
    assert_eq!(early.coordinator.tip(), Some(early.id("c9")));
    assert_eq!(early.coordinator.witnessed_level_of(&early.id("c9")), Some(3));
    assert!(!early.is_stable("a1"));
    assert_eq!(early.coordinator.last_stable_mci(), 0);
    for k in 1..=8 {
        early.coordinator.add_unit(&early.id(&format!("alt{}", k))).unwrap();
    }
    for name in &late_order {
        late.coordinator.add_unit(&late.id(name)).unwrap();
    }

    for h in [&early, &late] {
        let c = &h.coordinator;
        assert_eq!(c.witnessed_level_of(&h.id("c8")), Some(2));
        assert_eq!(c.witnessed_level_of(&h.id("alt5")), Some(3));
        assert_eq!(c.witnessed_level_of(&h.id("alt6")), Some(5));
        assert_eq!(c.witnessed_level_of(&h.id("alt7")), Some(6));
        assert_eq!(c.witnessed_level_of(&h.id("alt8")), Some(7));
        assert_eq!(c.tip(), Some(h.id("alt8")));
        assert_eq!(c.last_stable_mci(), 0);
        assert_eq!(h.mci("b1"), Some(1));
        assert_eq!(h.mci("a1"), None);
        for k in 1..=8 {
            assert_eq!(h.mci(&format!("alt{}", k)), Some(k + 1));
        }
        common::assert_contiguous(&c.main_chain());
    }
    assert_eq!(early.coordinator.main_chain(), late.coordinator.main_chain());
    for (name, id) in early.names() {
        assert_eq!(early.is_stable(name), late.coordinator.is_stable(id), "{}", name);
        assert_eq!(early.mci(name), late.coordinator.main_chain_index_of(id), "{}", name);
    }
}
