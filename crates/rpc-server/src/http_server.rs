//! HTTP JSON-RPC Server
//!
//! JSON-RPC 2.0 over `POST /`. Parameters are positional; unit ids are
//! base58 strings.

use crate::methods::{
    handle_get_health, handle_get_last_stable_mci, handle_get_main_chain, handle_get_main_chain_index,
    handle_get_stats, handle_get_unit_status, handle_get_witnessed_level, handle_is_stable,
    handle_submit_unit, parse_unit_id, GetMainChainRequest, RpcContext, RpcError,
};
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use dag_consensus::{Unit, UnitId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    fn from_result(id: Value, result: Result<Value, RpcError>) -> Self {
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(e) => {
                let error = JsonRpcError {
                    code: error_code(&e),
                    message: e.to_string(),
                };
                (None, Some(error))
            }
        };
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        }
    }
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
}

impl HttpRpcServer {
    pub fn new(context: Arc<RpcContext>) -> Self {
        Self { context }
    }

    /// Router with permissive CORS for browser clients
    pub fn router(self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.context)
    }

    /// Serve until `shutdown` resolves
    pub async fn run(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("JSON-RPC listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn handle_rpc(
    State(context): State<Arc<RpcContext>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    if request.jsonrpc != "2.0" {
        tracing::debug!("Request {} uses jsonrpc {:?}", request.id, request.jsonrpc);
    }
    let result = dispatch(&context, &request.method, request.params);
    (StatusCode::OK, Json(JsonRpcResponse::from_result(request.id, result)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

fn positional(params: Value) -> Vec<Value> {
    match params {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// First positional parameter as a unit id
fn unit_id_param(params: &[Value]) -> Result<UnitId, RpcError> {
    let id = params
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::InvalidParams("Missing unit id".to_string()))?;
    parse_unit_id(id)
}

fn dispatch(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    tracing::debug!("RPC {}", method);
    let params = positional(params);
    match method {
        "submitUnit" => {
            let unit = params
                .into_iter()
                .next()
                .ok_or_else(|| RpcError::InvalidParams("Missing unit".to_string()))?;
            let unit: Unit = serde_json::from_value(unit)
                .map_err(|e| RpcError::InvalidParams(format!("Invalid unit: {}", e)))?;
            Ok(json!(handle_submit_unit(ctx, unit)?))
        }

        "isStable" => to_json(handle_is_stable(ctx, &unit_id_param(&params)?)?),

        "getMainChainIndex" => to_json(handle_get_main_chain_index(ctx, &unit_id_param(&params)?)?),

        "getWitnessedLevel" => to_json(handle_get_witnessed_level(ctx, &unit_id_param(&params)?)?),

        "getUnitStatus" => to_json(handle_get_unit_status(ctx, &unit_id_param(&params)?)?),

        "getLastStableMci" => Ok(json!(handle_get_last_stable_mci(ctx)?)),

        "getMainChain" => {
            let request = match params.into_iter().next() {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| RpcError::InvalidParams(format!("Invalid range: {}", e)))?,
                None => GetMainChainRequest::default(),
            };
            to_json(handle_get_main_chain(ctx, request)?)
        }

        "getStats" => to_json(handle_get_stats(ctx)?),

        "getHealth" => Ok(json!(handle_get_health(ctx)?)),

        "getVersion" => Ok(json!({
            "dag-node": env!("CARGO_PKG_VERSION"),
            "witnesses": ctx.coordinator.config().witness_count,
            "majority": ctx.coordinator.config().majority,
        })),

        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
        RpcError::UnknownUnit(_) => -32001,
    }
}
