//! Node Configuration

use dag_consensus::ConsensusConfig;
use dag_runtime::{IngestConfig, DEFAULT_TICK_MS, MAX_UNITS_PER_TICK, PARK_CAPACITY};
use rpc_server::DEFAULT_RPC_ADDR;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node configuration, read from a JSON file; every field is optional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP RPC bind address
    pub rpc_addr: String,
    /// Data directory for the sled database
    pub data_dir: PathBuf,
    /// Ingest tick in milliseconds
    pub tick_ms: u64,
    pub max_units_per_tick: usize,
    pub park_capacity: usize,
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_addr: DEFAULT_RPC_ADDR.to_string(),
            data_dir: PathBuf::from("./data"),
            tick_ms: DEFAULT_TICK_MS,
            max_units_per_tick: MAX_UNITS_PER_TICK,
            park_capacity: PARK_CAPACITY,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the consensus rules cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        let consensus = &self.consensus;
        if consensus.majority == 0 || consensus.majority > consensus.witness_count {
            anyhow::bail!(
                "majority {} must be between 1 and the witness count {}",
                consensus.majority,
                consensus.witness_count
            );
        }
        if self.tick_ms == 0 {
            anyhow::bail!("tick_ms must be positive");
        }
        Ok(())
    }

    pub fn ingest(&self, verbose: bool) -> IngestConfig {
        IngestConfig {
            tick_ms: self.tick_ms,
            max_units_per_tick: self.max_units_per_tick,
            park_capacity: self.park_capacity,
            verbose,
        }
    }
}
