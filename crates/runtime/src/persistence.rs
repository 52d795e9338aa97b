//! Persistence layer for consensus state
//!
//! Uses a sled embedded database. Every commit batch is applied in one
//! multi-tree transaction (units, statuses, main-chain index, metadata and
//! the notification outbox) and flushed before returning. A failed flush
//! poisons the store: the batch may already be visible in the trees, so
//! later commits are refused until the node reopens and reloads.

use dag_consensus::{
    CommitBatch, ConsensusStore, PersistedLedger, StabilizedUnit, StoreError, UnitId, UnitNode, UnitStatus,
};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use parking_lot::Mutex;
use sled::{Db, Transactional};
use std::path::Path;

const CHAIN_KEY: &[u8] = b"chain";

/// Metadata about the persisted ledger
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainMetadata {
    pub last_stable_mci: u64,
    /// Highest outbox sequence ever committed
    pub last_event_seq: u64,
    pub unit_count: u64,
    pub commits: u64,
    /// Unix timestamp (ms) of the last commit
    pub last_commit_ts: i64,
}

/// Sled-backed consensus store
pub struct SledStore {
    db: Db,
    units: sled::Tree,
    statuses: sled::Tree,
    /// MCI (big-endian) -> unit id
    main_chain: sled::Tree,
    meta: sled::Tree,
    /// Event sequence (big-endian) -> notification
    outbox: sled::Tree,
    poisoned: Mutex<Option<String>>,
    #[cfg(test)]
    flush_failures: std::sync::atomic::AtomicUsize,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn io(e: sled::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn unit_id(bytes: &[u8]) -> Result<UnitId, StoreError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization(format!("unit key of {} bytes", bytes.len())))?;
    Ok(UnitId(arr))
}

fn index_key(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization(format!("index key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// A commit batch pre-serialized outside the transaction
#[derive(Default)]
struct EncodedBatch {
    units: Vec<(Vec<u8>, Vec<u8>)>,
    statuses: Vec<(Vec<u8>, Vec<u8>)>,
    cleared: Vec<[u8; 8]>,
    assigned: Vec<([u8; 8], Vec<u8>)>,
    outbox: Vec<([u8; 8], Vec<u8>)>,
}

impl EncodedBatch {
    fn new(batch: &CommitBatch) -> Result<Self, StoreError> {
        let mut encoded = EncodedBatch::default();
        for node in &batch.new_units {
            encoded.units.push((node.id.0.to_vec(), encode(node)?));
        }
        for (id, status) in &batch.status_updates {
            encoded.statuses.push((id.0.to_vec(), encode(status)?));
        }
        encoded.cleared = batch.main_chain_cleared.iter().map(|mci| mci.to_be_bytes()).collect();
        encoded.assigned = batch
            .main_chain_assigned
            .iter()
            .map(|(mci, id)| (mci.to_be_bytes(), id.0.to_vec()))
            .collect();
        for event in &batch.notifications {
            encoded.outbox.push((event.seq.to_be_bytes(), encode(event)?));
        }
        Ok(encoded)
    }
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let store = Self::with_db(db)?;
        tracing::info!("Opened consensus store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Use an already opened database
    pub fn with_db(db: Db) -> anyhow::Result<Self> {
        Ok(Self {
            units: db.open_tree("units")?,
            statuses: db.open_tree("statuses")?,
            main_chain: db.open_tree("main_chain")?,
            meta: db.open_tree("meta")?,
            outbox: db.open_tree("outbox")?,
            db,
            poisoned: Mutex::new(None),
            #[cfg(test)]
            flush_failures: Default::default(),
        })
    }

    /// Whether a failed flush has left the store refusing commits
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some()
    }

    fn flush_committed(&self) -> Result<(), sled::Error> {
        #[cfg(test)]
        let injected = self
            .flush_failures
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
                "injected flush failure",
            )));
        }
        self.db.flush()?;
        Ok(())
    }

    /// Database handle, shared with the unit log
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn metadata(&self) -> anyhow::Result<ChainMetadata> {
        match self.meta.get(CHAIN_KEY)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(ChainMetadata::default()),
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl ConsensusStore for SledStore {
    fn load(&self) -> Result<PersistedLedger, StoreError> {
        let mut persisted = PersistedLedger::default();

        for entry in self.units.iter() {
            let (_, value) = entry.map_err(io)?;
            persisted.units.push(decode::<UnitNode>(&value)?);
        }
        for entry in self.statuses.iter() {
            let (key, value) = entry.map_err(io)?;
            persisted.statuses.push((unit_id(&key)?, decode::<UnitStatus>(&value)?));
        }
        for entry in self.main_chain.iter() {
            let (key, value) = entry.map_err(io)?;
            persisted.main_chain.push((index_key(&key)?, unit_id(&value)?));
        }
        for entry in self.outbox.iter() {
            let (_, value) = entry.map_err(io)?;
            persisted.pending_notifications.push(decode::<StabilizedUnit>(&value)?);
        }

        if let Some(bytes) = self.meta.get(CHAIN_KEY).map_err(io)? {
            let metadata: ChainMetadata = decode(&bytes)?;
            persisted.last_stable_mci = metadata.last_stable_mci;
            persisted.last_event_seq = metadata.last_event_seq;
        }
        Ok(persisted)
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        if let Some(reason) = self.poisoned.lock().as_ref() {
            return Err(StoreError::Poisoned(reason.clone()));
        }
        let encoded = EncodedBatch::new(batch)?;
        let new_units = batch.new_units.len() as u64;
        let last_event_seq = batch.notifications.iter().map(|e| e.seq).max();
        let now = chrono::Utc::now().timestamp_millis();

        let result: TransactionResult<(), StoreError> = (
            &self.units,
            &self.statuses,
            &self.main_chain,
            &self.meta,
            &self.outbox,
        )
            .transaction(|(units, statuses, main_chain, meta, outbox)| {
                for (key, value) in &encoded.units {
                    units.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &encoded.statuses {
                    statuses.insert(key.as_slice(), value.as_slice())?;
                }
                for key in &encoded.cleared {
                    main_chain.remove(&key[..])?;
                }
                for (key, value) in &encoded.assigned {
                    main_chain.insert(&key[..], value.as_slice())?;
                }
                for (key, value) in &encoded.outbox {
                    outbox.insert(&key[..], value.as_slice())?;
                }

                let mut metadata: ChainMetadata = match meta.get(CHAIN_KEY)? {
                    Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => ChainMetadata::default(),
                };
                if let Some(mci) = batch.last_stable_mci {
                    metadata.last_stable_mci = mci;
                }
                if let Some(seq) = last_event_seq {
                    metadata.last_event_seq = metadata.last_event_seq.max(seq);
                }
                metadata.unit_count += new_units;
                metadata.commits += 1;
                metadata.last_commit_ts = now;
                let bytes = encode(&metadata).map_err(ConflictableTransactionError::Abort)?;
                meta.insert(CHAIN_KEY, bytes)?;
                Ok(())
            });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(StoreError::CommitFailed(e.to_string())),
        }

        if let Err(e) = self.flush_committed() {
            let reason = format!("flush after commit failed: {}", e);
            tracing::error!("Consensus store poisoned: {}", reason);
            *self.poisoned.lock() = Some(reason.clone());
            return Err(StoreError::Poisoned(reason));
        }
        Ok(())
    }

    fn mark_delivered(&self, seq: u64) -> Result<(), StoreError> {
        let mut delivered = sled::Batch::default();
        for entry in self.outbox.range(..=seq.to_be_bytes()) {
            let (key, _) = entry.map_err(io)?;
            delivered.remove(key);
        }
        self.outbox.apply_batch(delivered).map_err(io)?;
        self.outbox.flush().map_err(io)?;
        Ok(())
    }
}
