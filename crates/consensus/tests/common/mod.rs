//! Shared helpers for consensus integration tests

#![allow(dead_code)]

use dag_consensus::{
    Address, ConsensusConfig, ConsensusStore, Coordinator, MemoryStore, MemoryUnitStore, Sequence, Unit,
    UnitId, UnitStore, WitnessListRef,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Witness address `W01`..`W12`
pub fn witness(i: usize) -> Address {
    Address::new(format!("W{:02}", i))
}

/// Witnesses taking turns: unit `i` of a chain is authored by `W((i-1) % 12 + 1)`
pub fn cycling_witness(i: usize) -> Address {
    witness((i - 1) % 12 + 1)
}

pub fn witness_addresses() -> Vec<Address> {
    (1..=12).map(witness).collect()
}

/// A coordinator over in-memory stores with units addressed by name
pub struct Harness {
    pub units: Arc<MemoryUnitStore>,
    pub store: Arc<MemoryStore>,
    pub coordinator: Coordinator,
    names: HashMap<String, UnitId>,
    genesis: Option<UnitId>,
    clock: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ConsensusConfig::default())
    }

    pub fn with_config(config: ConsensusConfig) -> Self {
        let units = Arc::new(MemoryUnitStore::new());
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::builder(
            units.clone() as Arc<dyn UnitStore>,
            store.clone() as Arc<dyn ConsensusStore>,
        )
        .config(config)
        .open()
        .unwrap();
        Self {
            units,
            store,
            coordinator,
            names: HashMap::new(),
            genesis: None,
            clock: 0,
        }
    }

    /// Record and admit the genesis unit with the standard witness list
    pub fn genesis(&mut self, author: Address) -> UnitId {
        let unit = Unit::new(
            vec![],
            vec![author],
            WitnessListRef::Inline(witness_addresses()),
            Sequence::Good,
            0,
        );
        let id = unit.id;
        self.units.insert(unit).unwrap();
        self.coordinator.add_unit(&id).unwrap();
        self.names.insert("G".to_string(), id);
        self.genesis = Some(id);
        id
    }

    /// Record a unit in the unit store without admitting it
    pub fn record_with(&mut self, name: &str, parents: &[&str], author: Address, sequence: Sequence) -> UnitId {
        self.record_authored(name, parents, vec![author], sequence)
    }

    /// Record a unit with any number of authors
    pub fn record_authored(
        &mut self,
        name: &str,
        parents: &[&str],
        authors: Vec<Address>,
        sequence: Sequence,
    ) -> UnitId {
        self.clock += 1;
        let parents = parents.iter().map(|p| self.id(p)).collect();
        let genesis = self.genesis.expect("genesis first");
        let unit = Unit::new(
            parents,
            authors,
            WitnessListRef::SameAs(genesis),
            sequence,
            self.clock,
        );
        let id = unit.id;
        self.units.insert(unit).unwrap();
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn record(&mut self, name: &str, parents: &[&str], author: Address) -> UnitId {
        self.record_with(name, parents, author, Sequence::Good)
    }

    /// Record and admit a unit
    pub fn unit(&mut self, name: &str, parents: &[&str], author: Address) -> UnitId {
        let id = self.record(name, parents, author);
        self.coordinator.add_unit(&id).unwrap();
        id
    }

    /// Record and admit a unit signed by several authors
    pub fn unit_by(&mut self, name: &str, parents: &[&str], authors: Vec<Address>) -> UnitId {
        let id = self.record_authored(name, parents, authors, Sequence::Good);
        self.coordinator.add_unit(&id).unwrap();
        id
    }

    pub fn id(&self, name: &str) -> UnitId {
        *self
            .names
            .get(name)
            .unwrap_or_else(|| panic!("unknown unit {}", name))
    }

    pub fn mci(&self, name: &str) -> Option<u64> {
        self.coordinator.main_chain_index_of(&self.id(name))
    }

    pub fn is_stable(&self, name: &str) -> bool {
        self.coordinator.is_stable(&self.id(name))
    }

    pub fn names(&self) -> impl Iterator<Item = (&String, &UnitId)> {
        self.names.iter()
    }
}

/// Main-chain indexes must run 0, 1, 2, ... without gaps
pub fn assert_contiguous(main_chain: &[(u64, UnitId)]) {
    for (expected, (mci, _)) in main_chain.iter().enumerate() {
        assert_eq!(*mci, expected as u64, "main chain has a gap: {:?}", main_chain);
    }
}
