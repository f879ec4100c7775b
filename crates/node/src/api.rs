//! HTTP surface: node registration/update plus calendar readback for the
//! anchor URIs embedded in proofs.
//!
//! Every error body is `{code, message}` with the stable code strings the
//! registry contract names; node software switches on `code`, never on the
//! message text.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use dtsn_audit::NodeRegistry;
use dtsn_calendar::BlockStore;
use dtsn_common::error::CoreError;

const VERSION_HEADER: &str = "x-node-version";
const RANDOM_SAMPLE_SIZE: usize = 25;

pub struct AppState {
    pub registry: NodeRegistry,
    pub store: Arc<BlockStore>,
    pub blacklist: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodes/random", get(nodes_random))
        .route("/nodes/blacklist", get(nodes_blacklist))
        .route("/node", post(create_node))
        .route("/node/:tnt_addr", put(update_node))
        .route("/calendar/:id", get(calendar_block))
        .route("/calendar/:id/hash", get(calendar_hash))
        .route("/calendar/:id/data", get(calendar_data))
        .with_state(state)
}

// ════════════════════════════════════════════════════════════════════════════
// ERROR MAPPING
// ════════════════════════════════════════════════════════════════════════════

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) | CoreError::AuthFailure(_) => StatusCode::BAD_REQUEST,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::CapacityExceeded(_) => StatusCode::FORBIDDEN,
            CoreError::UpgradeRequired(_) => StatusCode::UPGRADE_REQUIRED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::DependencyUnavailable(_)
            | CoreError::Transient(_)
            | CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn require_version(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            ApiError(CoreError::Validation(format!("missing {} header", VERSION_HEADER)))
        })
}

// ════════════════════════════════════════════════════════════════════════════
// NODE DISCOVERY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct RandomNode {
    public_uri: String,
}

async fn nodes_random(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let sample = state.registry.store().random_healthy(RANDOM_SAMPLE_SIZE)?;
    let body: Vec<RandomNode> = sample
        .into_iter()
        .filter_map(|n| n.public_uri.map(|public_uri| RandomNode { public_uri }))
        .collect();
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(body),
    )
        .into_response())
}

async fn nodes_blacklist(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CACHE_CONTROL, "public, max-age=600")],
        Json(json!({ "blacklist": state.blacklist })),
    )
        .into_response()
}

// ════════════════════════════════════════════════════════════════════════════
// REGISTRATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct CreateNodeReq {
    tnt_addr: String,
    public_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateNodeReq {
    public_uri: Option<String>,
    hmac: String,
}

#[derive(Debug, Serialize)]
struct NodeResponse {
    tnt_addr: String,
    public_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hmac_key: Option<String>,
}

async fn create_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNodeReq>,
) -> Result<(StatusCode, Json<NodeResponse>), ApiError> {
    let version = require_version(&headers)?;
    let node = state
        .registry
        .create(&body.tnt_addr, body.public_uri.as_deref(), &version)
        .await?;
    Ok((
        StatusCode::OK,
        Json(NodeResponse {
            tnt_addr: node.tnt_addr,
            public_uri: node.public_uri,
            // the one and only time the key is returned
            hmac_key: Some(node.hmac_key),
        }),
    ))
}

async fn update_node(
    State(state): State<Arc<AppState>>,
    Path(tnt_addr): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateNodeReq>,
) -> Result<Json<NodeResponse>, ApiError> {
    let version = require_version(&headers)?;
    let node = state
        .registry
        .update(&tnt_addr, body.public_uri.as_deref(), &body.hmac, &version)
        .await?;
    Ok(Json(NodeResponse {
        tnt_addr: node.tnt_addr,
        public_uri: node.public_uri,
        hmac_key: None,
    }))
}

// ════════════════════════════════════════════════════════════════════════════
// CALENDAR READBACK
// ════════════════════════════════════════════════════════════════════════════

fn block_or_404(state: &AppState, id: u64) -> Result<dtsn_calendar::Block, ApiError> {
    state
        .store
        .by_id(id)
        .map_err(|e| CoreError::DependencyUnavailable(format!("block store: {}", e)))?
        .ok_or_else(|| ApiError(CoreError::NotFound(format!("no block {}", id))))
}

async fn calendar_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<dtsn_calendar::Block>, ApiError> {
    Ok(Json(block_or_404(&state, id)?))
}

async fn calendar_hash(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<String, ApiError> {
    Ok(block_or_404(&state, id)?.hash)
}

async fn calendar_data(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<String, ApiError> {
    Ok(block_or_404(&state, id)?.data_val)
}
