//! RPC Server - JSON-RPC over HTTP for the DAG node
//!
//! Query methods: isStable, getMainChainIndex, getWitnessedLevel,
//! getUnitStatus, getLastStableMci, getMainChain, getStats, getHealth,
//! getVersion. Units are submitted with submitUnit.

pub mod http_server;
pub mod methods;

pub use http_server::HttpRpcServer;
pub use methods::{RpcContext, RpcError};

/// Default HTTP RPC bind address
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:6611";
