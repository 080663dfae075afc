//! REST API server for Miniroha
//!
//! Submission, queries, and the consensus message endpoint. Every response
//! uses the `{success: true, ...}` / `{error, message}` envelope; missing
//! entities map to `{error: "Not found"}`.

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::consensus::{ConsensusEngine, ConsensusMessage};
use crate::error::{StorageError, ValidationError};
use crate::mempool::{Mempool, MempoolError};
use crate::state::StateStore;
use crate::transaction::validation::AdmissionError;
use crate::transaction::{Instruction, Transaction, TransactionValidator};

/// Shared handler context.
pub struct ApiContext {
    pub state: StateStore,
    pub mempool: Arc<RwLock<Mempool>>,
    /// Present when the node runs with BFT consensus enabled.
    pub engine: Option<Arc<ConsensusEngine>>,
    pub node_id: String,
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Mempool(MempoolError),
    Storage(StorageError),
    MalformedRequest(String),
    NotFound,
    ConsensusDisabled,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(e) => {
                (StatusCode::BAD_REQUEST, e.code().to_string(), e.to_string())
            }
            ApiError::Mempool(e) => (
                StatusCode::CONFLICT,
                "MEMPOOL_REJECTED".to_string(),
                e.to_string(),
            ),
            ApiError::Storage(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR".to_string(),
                e.to_string(),
            ),
            ApiError::MalformedRequest(msg) => {
                (StatusCode::BAD_REQUEST, "MALFORMED_REQUEST".to_string(), msg)
            }
            ApiError::NotFound => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Not found" })),
                )
                    .into_response()
            }
            ApiError::ConsensusDisabled => (
                StatusCode::BAD_REQUEST,
                "CONSENSUS_DISABLED".to_string(),
                "this node does not run the consensus engine".to_string(),
            ),
        };
        (status, Json(json!({ "error": error, "message": message }))).into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Rejected(e) => ApiError::Validation(e),
            AdmissionError::Storage(e) => ApiError::Storage(e),
        }
    }
}

impl From<MempoolError> for ApiError {
    fn from(err: MempoolError) -> Self {
        ApiError::Mempool(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(err)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
struct SubmitRequest {
    tx: Transaction,
}

/// Extracts a submission from the request body, keeping rejections inside
/// the `{error, message}` envelope. An instruction whose `type` tag names no
/// known variant surfaces as `UNKNOWN_INSTRUCTION`; `Instruction` is a
/// closed sum, so the tag has to be caught on the raw value before typed
/// deserialization throws it away.
#[axum::async_trait]
impl<S: Send + Sync> FromRequest<S> for SubmitRequest {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<serde_json::Value>::from_request(req, state)
            .await
            .map_err(|err| ApiError::MalformedRequest(err.to_string()))?;
        if let Some(kind) = unknown_instruction_kind(&value) {
            return Err(ApiError::Validation(ValidationError::UnknownInstruction(
                kind,
            )));
        }
        serde_json::from_value(value).map_err(|err| ApiError::MalformedRequest(err.to_string()))
    }
}

/// The first instruction `type` tag in the raw submission that names no
/// known variant, if any. A missing or non-string tag counts as unknown.
fn unknown_instruction_kind(value: &serde_json::Value) -> Option<String> {
    let instructions = value
        .get("tx")?
        .get("body")?
        .get("instructions")?
        .as_array()?;
    for instruction in instructions {
        let kind = instruction
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !Instruction::KINDS.contains(&kind) {
            return Some(kind.to_string());
        }
    }
    None
}

#[derive(Serialize)]
struct SubmitResponse {
    success: bool,
    tx_hash: String,
}

fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware: method, path, status, duration.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );
    response
}

// ============================================================================
// API Server
// ============================================================================

/// Builds the API router with all endpoints (exposed for testing).
pub fn build_router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![http::Method::GET, http::Method::POST])
        .allow_headers(vec![http::header::CONTENT_TYPE]);

    Router::new()
        .route("/tx", post(submit_tx))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/mempool", get(mempool))
        .route("/query/domain/:id", get(query_domain))
        .route("/query/account/:id", get(query_account))
        .route("/query/asset/:id", get(query_asset))
        .route("/query/balance/:asset_id/:account_id", get(query_balance))
        .route("/query/block/:height", get(query_block))
        .route("/consensus", post(consensus_message))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(ctx)
        .layer(cors)
}

/// Binds and serves the API until the process stops.
pub async fn run_api_server(
    ctx: Arc<ApiContext>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    ok(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn info(State(ctx): State<Arc<ApiContext>>) -> Result<Json<serde_json::Value>, ApiError> {
    let mempool_size = ctx.mempool.read().await.len();
    Ok(ok(json!({
        "chain_id": ctx.state.chain_id()?,
        "height": ctx.state.last_height()?,
        "node_id": ctx.node_id.clone(),
        "validators": ctx.state.validators()?.len(),
        "consensus": ctx.engine.is_some(),
        "mempool_size": mempool_size,
    })))
}

async fn mempool(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let pool = ctx.mempool.read().await;
    ok(json!({
        "count": pool.len(),
        "transactions": pool.transactions(),
    }))
}

async fn submit_tx(
    State(ctx): State<Arc<ApiContext>>,
    req: SubmitRequest,
) -> Result<Json<SubmitResponse>, ApiError> {
    TransactionValidator::new(&ctx.state).validate(&req.tx)?;
    let tx_hash = ctx.mempool.write().await.add(req.tx)?;
    Ok(Json(SubmitResponse {
        success: true,
        tx_hash,
    }))
}

async fn query_domain(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let domain = ctx.state.get_domain(&id)?.ok_or(ApiError::NotFound)?;
    Ok(ok(domain))
}

async fn query_account(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = ctx.state.get_account(&id)?.ok_or(ApiError::NotFound)?;
    let roles = ctx.state.get_account_roles(&id)?;
    Ok(ok(json!({
        "id": account.id,
        "public_key": account.public_key,
        "created_at": account.created_at,
        "roles": roles,
    })))
}

async fn query_asset(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let asset = ctx.state.get_asset(&id)?.ok_or(ApiError::NotFound)?;
    Ok(ok(asset))
}

async fn query_balance(
    State(ctx): State<Arc<ApiContext>>,
    Path((asset_id, account_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Absent balances read as zero, but only for existing operands.
    if ctx.state.get_asset(&asset_id)?.is_none()
        || ctx.state.get_account(&account_id)?.is_none()
    {
        return Err(ApiError::NotFound);
    }
    let amount = ctx.state.get_balance(&asset_id, &account_id)?;
    Ok(ok(json!({
        "asset_id": asset_id,
        "account_id": account_id,
        "amount": amount.to_str_radix(10),
    })))
}

async fn query_block(
    State(ctx): State<Arc<ApiContext>>,
    Path(height): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let block = ctx.state.get_block(height)?.ok_or(ApiError::NotFound)?;
    Ok(ok(block))
}

/// Dispatches an inbound consensus message to the engine. Message-level
/// failures are logged and dropped by the engine; delivery of a duplicate
/// message hash is a no-op, so retries are safe.
async fn consensus_message(
    State(ctx): State<Arc<ApiContext>>,
    Json(message): Json<ConsensusMessage>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = ctx.engine.as_ref().ok_or(ApiError::ConsensusDisabled)?;
    match engine.handle_message(message).await {
        Ok(()) => Ok(Json(json!({ "success": true }))),
        Err(err) => Ok(Json(json!({
            "success": false,
            "dropped": err.to_string(),
        }))),
    }
}
