//! DAG runtime - durable storage and ingest around the consensus core
//!
//! This crate provides:
//! - A sled-backed `ConsensusStore` committing each batch in one transaction
//! - A write-through unit store restored from disk on startup
//! - The ingest loop that records, parks and admits submitted units

pub mod ingest;
pub mod persistence;
pub mod unit_log;

pub use ingest::{IngestConfig, IngestError, IngestUpdate, Ingestor, UnitSender};
pub use persistence::{ChainMetadata, SledStore};
pub use unit_log::{DurableUnitStore, RecordError, RecordUnits};

/// Ingest tick in milliseconds
pub const DEFAULT_TICK_MS: u64 = 100;

/// Maximum submissions drained per tick
pub const MAX_UNITS_PER_TICK: usize = 256;

/// Maximum units parked waiting for a dependency
pub const PARK_CAPACITY: usize = 10_000;

/// Capacity of the submission queue
pub const SUBMIT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the ingest update broadcast
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;
