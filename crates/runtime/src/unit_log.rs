//! Write-through unit store
//!
//! Recorded units live in memory for the consensus core and in a sled tree
//! so they can be restored on startup.

use dag_consensus::{MemoryUnitStore, StructuralError, Unit, UnitId, UnitMeta, UnitStore};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Errors recording a unit
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("unit log write failed: {0}")]
    Storage(#[from] sled::Error),
    #[error("unit log encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

/// A unit store that can record newly submitted units
pub trait RecordUnits: UnitStore {
    fn record_unit(&self, unit: Unit) -> Result<UnitMeta, RecordError>;

    fn is_recorded(&self, id: &UnitId) -> bool;
}

impl RecordUnits for MemoryUnitStore {
    fn record_unit(&self, unit: Unit) -> Result<UnitMeta, RecordError> {
        Ok(self.insert(unit)?)
    }

    fn is_recorded(&self, id: &UnitId) -> bool {
        self.contains(id)
    }
}

/// Unit store backed by memory with a durable log
pub struct DurableUnitStore {
    memory: MemoryUnitStore,
    log: sled::Tree,
    /// Held from validation until the unit is published
    write: Mutex<()>,
    #[cfg(test)]
    append_failures: std::sync::atomic::AtomicUsize,
}

impl DurableUnitStore {
    /// Open the unit log in `db` and restore every recorded unit
    pub fn open(db: &sled::Db, witness_count: usize) -> anyhow::Result<Self> {
        let log = db.open_tree("recorded_units")?;
        let memory = MemoryUnitStore::with_witness_count(witness_count);

        let mut recorded: Vec<UnitMeta> = Vec::with_capacity(log.len());
        for entry in log.iter() {
            let (_, value) = entry?;
            recorded.push(bincode::deserialize(&value)?);
        }
        recorded.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));

        let count = recorded.len();
        for meta in recorded {
            memory.restore(meta)?;
        }
        if count > 0 {
            tracing::info!("Restored {} recorded units from disk", count);
        }
        Ok(Self {
            memory,
            log,
            write: Mutex::new(()),
            #[cfg(test)]
            append_failures: Default::default(),
        })
    }

    /// Validate, append to the log, then publish in memory
    ///
    /// A unit whose log append fails is not recorded at all.
    pub fn record(&self, unit: Unit) -> Result<UnitMeta, RecordError> {
        let _guard = self.write.lock();
        let meta = self.memory.validate(unit)?;
        let bytes = bincode::serialize(&meta)?;
        self.append(&meta.id, bytes)?;
        self.memory.publish(meta.clone());
        Ok(meta)
    }

    fn append(&self, id: &UnitId, bytes: Vec<u8>) -> Result<(), sled::Error> {
        #[cfg(test)]
        let injected = self
            .append_failures
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        #[cfg(not(test))]
        let injected = false;
        if injected {
            return Err(sled::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        self.log.insert(id.0, bytes)?;
        Ok(())
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.memory.contains(id)
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.log.flush()?;
        Ok(())
    }
}

impl RecordUnits for DurableUnitStore {
    fn record_unit(&self, unit: Unit) -> Result<UnitMeta, RecordError> {
        self.record(unit)
    }

    fn is_recorded(&self, id: &UnitId) -> bool {
        self.contains(id)
    }
}

impl UnitStore for DurableUnitStore {
    fn get_unit(&self, id: &UnitId) -> Option<UnitMeta> {
        self.memory.get_unit(id)
    }

    fn get_free_units(&self) -> BTreeSet<UnitId> {
        self.memory.get_free_units()
    }

    fn children_of(&self, id: &UnitId) -> BTreeSet<UnitId> {
        self.memory.children_of(id)
    }
}
