//! REST API handlers

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use gpufleet_core::{
    CatalogOptions, ComputeNode, FleetError, NodeConnectivity, Principal, RecordId, Workload,
    WorkloadStatus,
};
use gpufleet_scheduler::{CreateWorkload, NodeCandidate, NodeTest, WorkloadService};
use gpufleet_store::{NodeFilter, Page, Paged, WorkloadFilter};
use gpufleet_telemetry::ContainerStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::terminal::open_terminal;

/// Header carrying the caller's user id
pub const USER_HEADER: &str = "x-fleet-user";
/// Header marking the caller as an administrator
pub const ADMIN_HEADER: &str = "x-fleet-admin";

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<WorkloadService>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Create the API router
pub fn create_router(service: Arc<WorkloadService>, cors_enabled: bool) -> Router {
    let state = Arc::new(AppState { service });

    let router = Router::new()
        .route("/api/v1/specs/:id/candidates", get(get_candidates))
        .route("/api/v1/catalog", get(get_catalog))
        .route(
            "/api/v1/workloads",
            get(list_workloads)
                .post(create_workload)
                .delete(delete_workloads),
        )
        .route(
            "/api/v1/workloads/:id",
            get(get_workload).delete(delete_workload),
        )
        .route("/api/v1/workloads/:id/start", post(start_workload))
        .route("/api/v1/workloads/:id/stop", post(stop_workload))
        .route("/api/v1/workloads/:id/restart", post(restart_workload))
        .route("/api/v1/workloads/:id/stats", get(get_stats))
        .route("/api/v1/workloads/:id/logs", get(get_logs))
        .route("/api/v1/workloads/:id/terminal", get(open_terminal))
        .route("/api/v1/nodes", get(list_nodes).post(register_node))
        .route("/api/v1/nodes/:id", put(update_node))
        .route("/api/v1/nodes/:id/test", post(test_node))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Map a control-plane error onto an HTTP status
pub fn error_response(e: FleetError) -> (StatusCode, String) {
    let status = match &e {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        FleetError::InvalidRequest(_) | FleetError::ConfigIncomplete(_) => StatusCode::BAD_REQUEST,
        FleetError::Connection(_) | FleetError::ProvisionFailure(_) | FleetError::Engine { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(status = %status, error = %e, "Request failed");
    }
    (status, e.to_string())
}

/// The principal named by the trusted gateway headers
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };
        let user_id: RecordId = header(USER_HEADER)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    format!("missing or invalid {} header", USER_HEADER),
                )
            })?;
        let is_admin = header(ADMIN_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Ok(Caller(Principal { user_id, is_admin }))
    }
}

fn require_admin(caller: &Principal) -> ApiResult<()> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(error_response(FleetError::PermissionDenied(
            "node administration requires an administrator".to_string(),
        )))
    }
}

/// Fetch a workload the caller may see
async fn visible_workload(state: &AppState, caller: &Principal, id: RecordId) -> ApiResult<Workload> {
    let workload = state.service.get(id).await.map_err(error_response)?;
    if !caller.can_manage(&workload) {
        return Err(error_response(FleetError::PermissionDenied(format!(
            "workload {} belongs to another user",
            id
        ))));
    }
    Ok(workload)
}

/// Candidate query
#[derive(Debug, Default, Deserialize)]
pub struct CandidatesQuery {
    /// Image the workload would run
    #[serde(default)]
    pub image_id: Option<RecordId>,
}

/// Candidate nodes for a spec
async fn get_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
    Query(query): Query<CandidatesQuery>,
) -> ApiResult<Json<Vec<NodeCandidate>>> {
    let candidates = state
        .service
        .candidates(id, query.image_id)
        .await
        .map_err(error_response)?;
    Ok(Json(candidates))
}

/// Selection lists for create requests
async fn get_catalog(State(state): State<Arc<AppState>>) -> ApiResult<Json<CatalogOptions>> {
    Ok(Json(state.service.catalog().await.map_err(error_response)?))
}

/// Workload list query
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub status: Option<WorkloadStatus>,
    #[serde(default)]
    pub node_id: Option<RecordId>,
    #[serde(default)]
    pub search: Option<String>,
}

/// List workloads visible to the caller
async fn list_workloads(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Paged<Workload>>> {
    let filter = WorkloadFilter {
        status: query.status,
        node_id: query.node_id,
        search: query.search,
        ..Default::default()
    };
    let page = Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(0));
    let workloads = state
        .service
        .list(&caller, filter, page)
        .await
        .map_err(error_response)?;
    Ok(Json(workloads))
}

/// Create and provision a workload
async fn create_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<CreateWorkload>,
) -> ApiResult<(StatusCode, Json<Workload>)> {
    info!(
        user_id = caller.user_id,
        node_id = req.node_id,
        spec_id = req.spec_id,
        image_id = req.image_id,
        "Creating workload"
    );
    let workload = state
        .service
        .create(&caller, req)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(workload)))
}

/// Batch delete request
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<RecordId>,
}

/// Batch delete response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: Vec<RecordId>,
}

/// Delete several workloads
async fn delete_workloads(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    info!(user_id = caller.user_id, count = req.ids.len(), "Deleting workloads");
    let deleted = state
        .service
        .delete_many(&caller, &req.ids)
        .await
        .map_err(error_response)?;
    Ok(Json(DeleteResponse { deleted }))
}

/// Get a workload
async fn get_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<Workload>> {
    Ok(Json(visible_workload(&state, &caller, id).await?))
}

/// Delete a workload
async fn delete_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<StatusCode> {
    info!(user_id = caller.user_id, workload_id = id, "Deleting workload");
    state
        .service
        .delete(&caller, id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<Workload>> {
    let workload = state.service.start(&caller, id).await.map_err(error_response)?;
    Ok(Json(workload))
}

async fn stop_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<Workload>> {
    let workload = state.service.stop(&caller, id).await.map_err(error_response)?;
    Ok(Json(workload))
}

async fn restart_workload(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<Workload>> {
    let workload = state
        .service
        .restart(&caller, id)
        .await
        .map_err(error_response)?;
    Ok(Json(workload))
}

/// Live usage of a workload
async fn get_stats(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<ContainerStats>> {
    visible_workload(&state, &caller, id).await?;
    let stats = state.service.stats(id).await.map_err(error_response)?;
    Ok(Json(stats))
}

/// Log query
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u64>,
}

/// Recent output of a workload
async fn get_logs(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    visible_workload(&state, &caller, id).await?;
    state
        .service
        .logs(id, query.tail)
        .await
        .map_err(error_response)
}

/// A node as returned to callers, without TLS material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    pub id: RecordId,
    pub name: String,
    pub region: String,
    pub public_ip: String,
    pub engine_address: String,
    pub use_tls: bool,
    pub gpu_name: Option<String>,
    pub gpu_count: u64,
    pub gpu_memory_per_card_gb: u64,
    pub cpu_cores: u64,
    pub memory_gb: u64,
    pub listed: bool,
    pub connectivity: NodeConnectivity,
}

impl From<ComputeNode> for NodeResponse {
    fn from(node: ComputeNode) -> Self {
        Self {
            id: node.id,
            name: node.name,
            region: node.region,
            public_ip: node.public_ip,
            engine_address: node.engine_address,
            use_tls: node.use_tls,
            gpu_name: node.gpu_name,
            gpu_count: node.gpu_count,
            gpu_memory_per_card_gb: node.gpu_memory_per_card_gb,
            cpu_cores: node.cpu_cores,
            memory_gb: node.memory_gb,
            listed: node.listed,
            connectivity: node.connectivity,
        }
    }
}

/// List every node
async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<NodeResponse>>> {
    let nodes = state
        .service
        .nodes(&NodeFilter::default())
        .await
        .map_err(error_response)?;
    Ok(Json(nodes.into_iter().map(NodeResponse::from).collect()))
}

/// Register a node
async fn register_node(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(node): Json<ComputeNode>,
) -> ApiResult<(StatusCode, Json<NodeResponse>)> {
    require_admin(&caller)?;
    let node = state
        .service
        .register_node(node)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(NodeResponse::from(node))))
}

/// Replace a node's settings
async fn update_node(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
    Json(node): Json<ComputeNode>,
) -> ApiResult<Json<NodeResponse>> {
    require_admin(&caller)?;
    let node = state
        .service
        .update_node(id, node)
        .await
        .map_err(error_response)?;
    Ok(Json(NodeResponse::from(node)))
}

/// Probe a node's engine
async fn test_node(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
) -> ApiResult<Json<NodeTest>> {
    require_admin(&caller)?;
    let result = state.service.test_node(id).await.map_err(error_response)?;
    Ok(Json(result))
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub nodes: usize,
    pub connected_nodes: usize,
    pub workloads: u64,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let nodes = state
        .service
        .nodes(&NodeFilter::default())
        .await
        .map_err(error_response)?;
    let workloads = state
        .service
        .store()
        .workloads()
        .find_many(&WorkloadFilter::default(), Page::new(1, 1))
        .await
        .map_err(error_response)?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes: nodes.len(),
        connected_nodes: nodes
            .iter()
            .filter(|n| n.connectivity == NodeConnectivity::Connected)
            .count(),
        workloads: workloads.total,
    }))
}
