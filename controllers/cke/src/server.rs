//! HTTP surface
//!
//! Served by every instance, leader or not:
//!
//! - `GET /health`
//! - `GET /metrics` (Prometheus text format)
//! - `GET /api/v1/cluster`, `PUT /api/v1/cluster[?revision=N]`
//! - `GET /api/v1/records[?limit=N]`
//! - `POST /api/v1/records/cancel` (only meaningful on the leader)
//! - `GET /api/v1/leader`

use crate::error::{ControllerError, ErrorKind};
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::storage::Storage;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cluster_model::{Cluster, Record};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Records returned when no limit is given
const DEFAULT_RECORDS_LIMIT: usize = 20;

/// Shared state of the handlers
#[derive(Clone)]
pub struct ApiState {
    storage: Arc<Storage>,
    executor: Arc<Executor>,
    metrics: Metrics,
}

impl ApiState {
    pub fn new(storage: Arc<Storage>, executor: Arc<Executor>, metrics: Metrics) -> Self {
        Self {
            storage,
            executor,
            metrics,
        }
    }
}

/// Build the router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/api/v1/cluster", get(handle_get_cluster).put(handle_put_cluster))
        .route("/api/v1/records", get(handle_records))
        .route("/api/v1/records/cancel", post(handle_cancel))
        .route("/api/v1/leader", get(handle_leader))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(address: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(address).await.map_err(|e| {
        error!("Failed to bind HTTP server on {}: {}", address, e);
        ControllerError::Http(e.to_string())
    })?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ControllerError::Http(e.to_string()))?;
    info!("HTTP server stopped");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub revision: i64,
    pub cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutClusterResponse {
    pub revision: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevisionQuery {
    /// Expected current revision; 0 or absent means "must not exist"
    #[serde(default)]
    pub revision: i64,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

fn error_response(e: &ControllerError) -> Response {
    let status = match e.kind() {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("API request failed: {}", e);
    }
    (status, format!("Error: {e}")).into_response()
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => text.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_get_cluster(State(state): State<ApiState>) -> Response {
    match state.storage.get_cluster().await {
        Ok(Some((cluster, revision))) => Json(ClusterResponse { revision, cluster }).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Error: no cluster configured").into_response(),
        Err(e) => error_response(&e),
    }
}

/// Body is YAML or JSON
async fn handle_put_cluster(
    State(state): State<ApiState>,
    Query(query): Query<RevisionQuery>,
    body: String,
) -> Response {
    let cluster = match Cluster::from_yaml(&body) {
        Ok(cluster) => cluster,
        Err(e) => return error_response(&e.into()),
    };
    match state.storage.put_cluster(&cluster, query.revision).await {
        Ok(revision) => Json(PutClusterResponse { revision }).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_records(State(state): State<ApiState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RECORDS_LIMIT);
    match state.storage.records(limit).await {
        Ok(records) => Json::<Vec<Record>>(records).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_cancel(State(state): State<ApiState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.executor.cancel_running(),
    })
}

async fn handle_leader(State(state): State<ApiState>) -> Response {
    match state.storage.leader().await {
        Ok(leader) => Json(LeaderResponse { leader }).into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{SimulatedCluster, elect, sample_cluster};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup() -> (SimulatedCluster, Router) {
        let cluster = sample_cluster(1, 1);
        let sim = SimulatedCluster::unconfigured(&cluster).await;
        let metrics = Metrics::new().unwrap();
        let executor = Arc::new(Executor::new(sim.infra(), metrics.clone(), Duration::from_secs(5), 4));
        let app = router(ApiState::new(Arc::clone(&sim.storage), executor, metrics));
        (sim, app)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn put(uri: &str, body: String) -> Request<Body> {
        Request::builder().method("PUT").uri(uri).body(Body::from(body)).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_sim, app) = setup().await;
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_put_then_get_cluster() {
        let (_sim, app) = setup().await;
        let yaml = sample_cluster(1, 1).to_yaml().unwrap();

        let response = app.clone().oneshot(put("/api/v1/cluster", yaml)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: PutClusterResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(stored.revision > 0);

        let response = app.oneshot(get_req("/api/v1/cluster")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: ClusterResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(fetched.revision, stored.revision);
        assert_eq!(fetched.cluster, sample_cluster(1, 1));
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let (_sim, app) = setup().await;
        let yaml = sample_cluster(1, 1).to_yaml().unwrap();
        let response = app.clone().oneshot(put("/api/v1/cluster", yaml.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Creating again without the current revision must fail.
        let response = app.oneshot(put("/api/v1/cluster", yaml)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_cluster_is_rejected() {
        let (sim, app) = setup().await;
        let mut cluster = sample_cluster(1, 1);
        cluster.name = String::new();
        let response = app
            .oneshot(put("/api/v1/cluster", cluster.to_yaml().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(sim.storage.get_cluster().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_cluster_is_404() {
        let (_sim, app) = setup().await;
        let response = app.oneshot(get_req("/api/v1/cluster")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_records_and_leader() {
        let (sim, app) = setup().await;
        let (session, leader) = elect(&sim.storage).await;
        for op in ["ca-bootstrap", "etcd-bootstrap"] {
            let record = Record::new(op, vec![], session.id(), chrono::Utc::now());
            sim.storage.append_record(record, &leader).await.unwrap();
        }

        let response = app.clone().oneshot(get_req("/api/v1/records?limit=1")).await.unwrap();
        let records: Vec<Record> = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "etcd-bootstrap");

        let response = app.clone().oneshot(get_req("/api/v1/leader")).await.unwrap();
        let leader: LeaderResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(leader.leader.as_deref(), Some("test-controller"));

        let response = app
            .oneshot(Request::builder().method("POST").uri("/api/v1/records/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cancel: CancelResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(!cancel.cancelled);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_sim, app) = setup().await;
        let response = app.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("cke_leader"));
    }
}
