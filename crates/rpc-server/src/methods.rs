//! RPC Methods - JSON-RPC method handlers
//!
//! Query methods read the coordinator's committed state directly; unit
//! submission goes through the ingest queue.

use dag_consensus::{ConsensusStats, Coordinator, Unit, UnitId, UnitView};
use dag_runtime::{IngestError, UnitSender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Largest main-chain page a single call returns
pub const MAX_MAIN_CHAIN_PAGE: usize = 1000;

/// RPC context shared across handlers
pub struct RpcContext {
    pub coordinator: Arc<Coordinator>,
    pub unit_sender: UnitSender,
}

// ============ Request/Response Types ============

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetMainChainRequest {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainChainEntry {
    pub mci: u64,
    pub unit: UnitId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StabilityResponse {
    #[serde(rename = "isStable")]
    pub is_stable: bool,
    #[serde(rename = "lastStableMci")]
    pub last_stable_mci: u64,
}

// ============ RPC Handlers ============

pub fn parse_unit_id(s: &str) -> Result<UnitId, RpcError> {
    s.parse()
        .map_err(|e| RpcError::InvalidParams(format!("Invalid unit id {}: {}", s, e)))
}

/// Handle submitUnit RPC method
pub fn handle_submit_unit(ctx: &RpcContext, unit: Unit) -> Result<String, RpcError> {
    if !unit.has_valid_id() {
        return Err(RpcError::InvalidParams("Unit id does not match its header".to_string()));
    }
    let id = unit.id;
    ctx.unit_sender.send(unit).map_err(|e| match e {
        IngestError::QueueFull => RpcError::InternalError("Submission queue is full, retry later".to_string()),
        IngestError::Disconnected => RpcError::InternalError(e.to_string()),
    })?;
    Ok(id.to_string())
}

/// Handle isStable RPC method
pub fn handle_is_stable(ctx: &RpcContext, id: &UnitId) -> Result<StabilityResponse, RpcError> {
    Ok(StabilityResponse {
        is_stable: ctx.coordinator.is_stable(id),
        last_stable_mci: ctx.coordinator.last_stable_mci(),
    })
}

/// Handle getMainChainIndex RPC method (null when off the main chain)
pub fn handle_get_main_chain_index(ctx: &RpcContext, id: &UnitId) -> Result<Option<u64>, RpcError> {
    Ok(ctx.coordinator.main_chain_index_of(id))
}

/// Handle getWitnessedLevel RPC method (null for unknown units)
pub fn handle_get_witnessed_level(ctx: &RpcContext, id: &UnitId) -> Result<Option<u64>, RpcError> {
    Ok(ctx.coordinator.witnessed_level_of(id))
}

/// Handle getUnitStatus RPC method
pub fn handle_get_unit_status(ctx: &RpcContext, id: &UnitId) -> Result<UnitView, RpcError> {
    ctx.coordinator
        .unit_status(id)
        .ok_or_else(|| RpcError::UnknownUnit(id.to_string()))
}

pub fn handle_get_last_stable_mci(ctx: &RpcContext) -> Result<u64, RpcError> {
    Ok(ctx.coordinator.last_stable_mci())
}

/// Handle getMainChain RPC method
pub fn handle_get_main_chain(
    ctx: &RpcContext,
    params: GetMainChainRequest,
) -> Result<Vec<MainChainEntry>, RpcError> {
    let from = params.from.unwrap_or(0);
    let limit = params.limit.unwrap_or(MAX_MAIN_CHAIN_PAGE).min(MAX_MAIN_CHAIN_PAGE);
    Ok(ctx
        .coordinator
        .main_chain()
        .into_iter()
        .filter(|(mci, _)| *mci >= from)
        .take(limit)
        .map(|(mci, unit)| MainChainEntry { mci, unit })
        .collect())
}

pub fn handle_get_stats(ctx: &RpcContext) -> Result<ConsensusStats, RpcError> {
    Ok(ctx.coordinator.stats())
}

/// Handle getHealth RPC method
pub fn handle_get_health(ctx: &RpcContext) -> Result<String, RpcError> {
    if ctx.coordinator.tip().is_some() {
        Ok("ok".to_string())
    } else {
        Ok("awaiting-genesis".to_string())
    }
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Unknown unit: {0}")]
    UnknownUnit(String),
}
