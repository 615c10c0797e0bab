//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gpuclaim_core::{
    AllocationClaim, CatalogSource, ClaimSource, DeviceLease, NodeDeviceReport, PodRef,
    SchedError, ANNOTATION_ALLOCATED, VISIBLE_DEVICES_ENV,
};
use gpuclaim_scheduler::Scheduler;
use gpuclaim_store::{MemoryStore, StoreStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

type ApiError = (StatusCode, String);

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<MemoryStore>,
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>, store: Arc<MemoryStore>) -> Router {
    let state = Arc::new(AppState { scheduler, store });

    Router::new()
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/:name", get(get_node).put(put_node))
        .route(
            "/api/v1/claims/:namespace/:name",
            get(get_claim).put(put_claim),
        )
        .route("/api/v1/leases", get(list_leases))
        .route("/api/v1/schedule", post(schedule))
        .route("/api/v1/allocations/:namespace/:pod", get(get_allocation))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_status(e: SchedError) -> ApiError {
    let status = match &e {
        SchedError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_unschedulable() => StatusCode::CONFLICT,
        SchedError::TransientStore(_) | SchedError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// List all node reports
async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeDeviceReport>> {
    Json(state.store.list_node_reports().await)
}

/// Get one node report
async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<NodeDeviceReport>, ApiError> {
    let report = state.store.get_node_report(&name).await.map_err(error_status)?;
    Ok(Json(report))
}

/// Publish a node report, replacing the previous one
async fn put_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut report): Json<NodeDeviceReport>,
) -> StatusCode {
    report.node_name = name;
    state.store.put_node_report(report).await;
    StatusCode::NO_CONTENT
}

/// Get a claim
async fn get_claim(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<AllocationClaim>, ApiError> {
    let claim = state
        .store
        .get_claim(&namespace, &name)
        .await
        .map_err(error_status)?;
    Ok(Json(claim))
}

/// Create or replace a claim
async fn put_claim(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut claim): Json<AllocationClaim>,
) -> StatusCode {
    info!(namespace = %namespace, claim = %name, count = claim.devices.count, "Applying claim");
    claim.namespace = namespace;
    claim.name = name;
    state.store.put_claim(claim).await;
    StatusCode::NO_CONTENT
}

/// List leases in the scheduler's lease namespace
async fn list_leases(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceLease>>, ApiError> {
    let leases = state
        .scheduler
        .coordinator()
        .leases()
        .list(&CancellationToken::new())
        .await
        .map_err(error_status)?;
    Ok(Json(leases))
}

/// Request to run one scheduling cycle
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub namespace: String,
    pub pod: String,
    /// Pod uid, generated when absent
    #[serde(default)]
    pub uid: Option<String>,
    /// Claim name, the value of the claim annotation
    #[serde(default)]
    pub claim: Option<String>,
    /// Candidate nodes; every known node when absent
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
}

/// Result of a successful scheduling cycle
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub node: String,
    pub device_ids: Vec<u32>,
    /// Value of the allocated annotation
    pub allocation: String,
    /// Annotations and environment the admission mutator applies
    pub annotations: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

/// Run a scheduling cycle for a pod
async fn schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let uid = req.uid.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut pod = PodRef::new(req.namespace, req.pod, uid);
    pod.claim = req.claim;

    let nodes = match req.nodes {
        Some(nodes) => nodes,
        None => state.store.node_names().await,
    };

    info!(pod = %pod, nodes = nodes.len(), "Scheduling pod");

    // Detached so a client disconnect cancels the cycle instead of
    // abandoning its leases.
    let record = state
        .scheduler
        .schedule_detached(pod, nodes)
        .await
        .map_err(error_status)?;

    let allocation = record.to_string();
    let annotations = BTreeMap::from([(ANNOTATION_ALLOCATED.to_string(), allocation.clone())]);
    let env = BTreeMap::from([(VISIBLE_DEVICES_ENV.to_string(), record.device_list())]);

    Ok(Json(ScheduleResponse {
        node: record.node,
        device_ids: record.device_ids,
        allocation,
        annotations,
        env,
    }))
}

/// Allocation response
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub device_ids: Vec<u32>,
    pub allocation: String,
}

/// Get the committed allocation of a pod
async fn get_allocation(
    State(state): State<Arc<AppState>>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let record = state
        .store
        .allocation(&namespace, &pod)
        .await
        .ok_or_else(|| error_status(SchedError::NotFound(format!("allocation {}/{}", namespace, pod))))?;

    Ok(Json(AllocationResponse {
        namespace,
        pod,
        allocation: record.to_string(),
        node: record.node,
        device_ids: record.device_ids,
    }))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub lease_namespace: String,
    pub store: StoreStats,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        lease_namespace: state.scheduler.coordinator().leases().namespace().to_string(),
        store: state.store.stats().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gpuclaim_core::{Device, GpuclaimConfig};
    use gpuclaim_scheduler::CycleCoordinator;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = CycleCoordinator::new(
            &GpuclaimConfig::default(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(Arc::new(coordinator)));
        (store.clone(), create_router(scheduler, store))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_schedule_flow() {
        let (store, app) = app();
        store
            .put_node_report(NodeDeviceReport::new(
                "node-a",
                (0..4).map(|i| Device::new(i, "X", 10)).collect(),
            ))
            .await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v1/claims/ml/train",
                serde_json::json!({"devices": {"count": 2}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/schedule",
                serde_json::json!({"namespace": "ml", "pod": "trainer-0", "claim": "train"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let scheduled: ScheduleResponse = body_json(response).await;
        assert_eq!(scheduled.allocation, "node-a:0,1");
        assert_eq!(scheduled.env[VISIBLE_DEVICES_ENV], "0,1");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/allocations/ml/trainer-0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let allocation: AllocationResponse = body_json(response).await;
        assert_eq!(allocation.device_ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_, app) = app();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/nodes/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // No claim annotation: the pod is unschedulable.
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/schedule",
                serde_json::json!({"namespace": "ml", "pod": "p", "nodes": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            error_status(SchedError::TransientStore("x".into())).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(SchedError::InvalidClaim("x".into())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(SchedError::Internal("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
