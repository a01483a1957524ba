//! Axum routes for the layout service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::DistributedLayoutCoordinator;
use crate::error::LayoutError;
use crate::layering::LayoutProgress;
use crate::store::{InMemoryLayoutStore, LayoutStore};
use crate::types::{
    Edge, GraphNode, LayoutOptions, LayoutResult, LayoutStatistics, LevelNode, NodeFilter, Pin,
    RunId, SublevelNode,
};
use crate::LAYOUT_SCHEMA_VERSION;

use super::state::ServiceState;

/// Service state backed by the production store.
#[cfg(feature = "postgres")]
pub type AppState = ServiceState<crate::store::PostgresLayoutStore>;

/// Service names accepted by the health check besides the empty one.
const SERVICE_NAMES: [&str; 2] = ["layout", "LayoutService"];

// ============================================================================
// Request/Response Types
// ============================================================================

/// A block of the graph to lay out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInput {
    /// Block id, unique within the request.
    pub id: String,
    /// Opaque content, echoed back.
    #[serde(default)]
    pub content: String,
    /// Whether the block's placement is fixed.
    #[serde(default)]
    pub is_pinned: bool,
    /// Pinned level. Required when `is_pinned`.
    #[serde(default)]
    pub level: Option<u32>,
    /// Pinned sublevel. Without it a pin fixes the level only.
    #[serde(default)]
    pub sublevel_id: Option<u32>,
    /// Power-of-ten scale exponent of a pinned block.
    #[serde(default)]
    pub physical_scale: Option<i32>,
    /// Opaque metadata, echoed back.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A directed link between two blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInput {
    pub source_id: String,
    pub target_id: String,
}

/// CalculateLayout request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateLayoutRequest {
    pub blocks: Vec<BlockInput>,
    #[serde(default)]
    pub links: Vec<LinkInput>,
    #[serde(default)]
    pub options: LayoutOptions,
}

/// A placed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOutput {
    pub id: String,
    pub content: String,
    pub layer: u32,
    pub level: u32,
    pub sublevel_id: u32,
    pub column: u32,
    pub is_pinned: bool,
    pub physical_scale: Option<i32>,
    pub x: f64,
    pub y: f64,
    pub metadata: BTreeMap<String, String>,
}

/// CalculateLayout response. `success = false` carries `error_message` and
/// whatever statistics were measured before the failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateLayoutResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub blocks: Vec<BlockOutput>,
    pub levels: Vec<LevelNode>,
    pub sublevels: Vec<SublevelNode>,
    pub statistics: LayoutStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CalculateLayoutResponse {
    fn failed(run_id: Option<RunId>, error: &LayoutError, statistics: LayoutStatistics) -> Self {
        Self {
            success: false,
            run_id,
            blocks: Vec::new(),
            levels: Vec::new(),
            sublevels: Vec::new(),
            statistics,
            layout_hash: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }
}

/// HealthCheck query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthQuery {
    /// Service to check. Empty checks the whole server.
    #[serde(default)]
    pub service: Option<String>,
}

/// HealthCheck serving status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

/// HealthCheck response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
    pub message: String,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub schema_version: String,
    pub tracked_runs: usize,
    /// Store connectivity; absent when the service has no store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<bool>,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

// ============================================================================
// Request Conversion
// ============================================================================

/// Build a store holding exactly the request's graph.
///
/// Rejects empty or duplicate ids, pins without a level, links to unknown
/// blocks and self-loops.
fn build_store(request: &CalculateLayoutRequest) -> Result<InMemoryLayoutStore, LayoutError> {
    let store = InMemoryLayoutStore::new();
    let mut seen = HashSet::with_capacity(request.blocks.len());

    for block in &request.blocks {
        if block.id.is_empty() {
            return Err(LayoutError::Validation("block id must not be empty".into()));
        }
        if !seen.insert(block.id.as_str()) {
            return Err(LayoutError::Validation(format!(
                "duplicate block id: {}",
                block.id
            )));
        }
        let mut node = GraphNode::new(block.id.as_str());
        if block.is_pinned {
            let Some(level) = block.level else {
                return Err(LayoutError::Validation(format!(
                    "pinned block {} needs a level",
                    block.id
                )));
            };
            let mut pin = Pin::at_level(level, block.physical_scale.unwrap_or(0));
            pin.sublevel_id = block.sublevel_id;
            node = node.pinned(pin);
        }
        store.add_node(node);
    }

    for link in &request.links {
        for endpoint in [&link.source_id, &link.target_id] {
            if !seen.contains(endpoint.as_str()) {
                return Err(LayoutError::Validation(format!(
                    "link {} -> {} references unknown block {}",
                    link.source_id, link.target_id, endpoint
                )));
            }
        }
        let edge = Edge::new(link.source_id.as_str(), link.target_id.as_str());
        if edge.is_self_loop() {
            return Err(LayoutError::Validation(format!(
                "self-loop on block {}",
                link.source_id
            )));
        }
        store.add_edge(edge);
    }

    Ok(store)
}

fn into_response(request: &CalculateLayoutRequest, result: LayoutResult) -> CalculateLayoutResponse {
    let inputs: HashMap<&str, &BlockInput> =
        request.blocks.iter().map(|b| (b.id.as_str(), b)).collect();

    let blocks = result
        .blocks
        .into_iter()
        .map(|placement| {
            let input = inputs.get(placement.id.as_str());
            BlockOutput {
                content: input.map(|b| b.content.clone()).unwrap_or_default(),
                metadata: input.map(|b| b.metadata.clone()).unwrap_or_default(),
                id: placement.id.as_str().to_string(),
                layer: placement.layer,
                level: placement.level,
                sublevel_id: placement.sublevel_id,
                column: placement.column,
                is_pinned: placement.is_pinned,
                physical_scale: placement.physical_scale,
                x: placement.x,
                y: placement.y,
            }
        })
        .collect();

    CalculateLayoutResponse {
        success: true,
        run_id: Some(result.run_id),
        blocks,
        levels: result.levels,
        sublevels: result.sublevels,
        statistics: result.statistics,
        layout_hash: Some(result.layout_hash),
        error_code: None,
        error_message: None,
    }
}

fn status_for(error: &LayoutError) -> StatusCode {
    match error {
        LayoutError::Validation(_) | LayoutError::CycleRejected { .. } => StatusCode::BAD_REQUEST,
        LayoutError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        LayoutError::TransientStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// CalculateLayout: lay out the graph carried by the request.
async fn calculate_layout_handler<S: LayoutStore + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Json(request): Json<CalculateLayoutRequest>,
) -> (StatusCode, Json<CalculateLayoutResponse>) {
    let started = Instant::now();

    let store = match build_store(&request) {
        Ok(store) => store,
        Err(error) => {
            let statistics = LayoutStatistics {
                processing_time_ms: started.elapsed().as_millis() as u64,
                ..LayoutStatistics::default()
            };
            return (
                status_for(&error),
                Json(CalculateLayoutResponse::failed(None, &error, statistics)),
            );
        }
    };

    let coordinator = DistributedLayoutCoordinator::in_process_with_progress(
        Arc::new(store),
        state.config.clone(),
        Arc::clone(&state.progress),
    );
    let outcome = coordinator
        .calculate_layout(&NodeFilter::all(), &request.options)
        .await;
    coordinator.shutdown().await;

    match outcome {
        Ok(result) => (StatusCode::OK, Json(into_response(&request, result))),
        Err(failure) => (
            status_for(&failure.error),
            Json(CalculateLayoutResponse::failed(
                Some(failure.run_id),
                &failure.error,
                failure.statistics,
            )),
        ),
    }
}

/// HealthCheck: aggregate store reachability into a serving status.
async fn health_check_handler<S: LayoutStore + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Query(query): Query<HealthQuery>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    if let Some(service) = query.service.as_deref().filter(|s| !s.is_empty()) {
        if !SERVICE_NAMES.contains(&service) {
            return (
                StatusCode::NOT_FOUND,
                Json(HealthCheckResponse {
                    status: ServingStatus::NotServing,
                    message: format!("Unknown service: {service}"),
                }),
            );
        }
    }

    match state.store_healthy().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthCheckResponse {
                status: ServingStatus::Serving,
                message: "Service is healthy".to_string(),
            }),
        ),
        Err(cause) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthCheckResponse {
                status: ServingStatus::NotServing,
                message: format!("Store unreachable: {cause}"),
            }),
        ),
    }
}

/// Latest progress record of a run.
async fn run_progress_handler<S: LayoutStore + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(run_id): Path<String>,
) -> Result<Json<LayoutProgress>, (StatusCode, Json<ErrorResponse>)> {
    let run_id = RunId::parse(&run_id).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("INVALID_RUN_ID", format!("Invalid run id: {e}"))),
        )
    })?;
    state.progress.snapshot(&run_id).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("RUN_NOT_FOUND", format!("Unknown run: {run_id}"))),
        )
    })
}

/// Health check endpoint (detailed).
async fn health_handler<S: LayoutStore + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Json<HealthResponse> {
    let database = match &state.store {
        Some(_) => Some(state.store_healthy().await.is_ok()),
        None => None,
    };
    Json(HealthResponse {
        status: if database == Some(false) { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: LAYOUT_SCHEMA_VERSION.to_string(),
        tracked_runs: state.progress.len(),
        database,
    })
}

/// Liveness probe. Does not check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe. 503 while the store is unreachable.
async fn readiness_handler<S: LayoutStore + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
) -> impl IntoResponse {
    match state.store_healthy().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                details: None,
            }),
        ),
        Err(cause) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                details: Some(cause),
            }),
        ),
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the layout service.
pub fn create_router<S: LayoutStore + 'static>(state: ServiceState<S>) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/layout", post(calculate_layout_handler::<S>))
        .route("/api/layout/runs/:run_id", get(run_progress_handler::<S>))
        .route("/api/health", get(health_check_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S>))
        .with_state(state)
}
