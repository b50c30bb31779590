//! HTTP API Server
//!
//! REST API for cluster state queries and record writes.

use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::agent::ClusterHandle;
use crate::config::ApiConfig;
use crate::replication::{ReplicationCoordinator, SendStatus, WriteOutcome};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Membership and election for this node
    pub cluster: Arc<ClusterHandle>,
    /// Leader-side write path
    pub coordinator: Arc<ReplicationCoordinator>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        cluster: Arc<ClusterHandle>,
        coordinator: Arc<ReplicationCoordinator>,
    ) -> Self {
        let state = Arc::new(AppState { cluster, coordinator });
        Self { config, state }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/cluster-info", get(handle_cluster_info))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/records", get(handle_list_records).put(handle_put_record))
            .route("/health", get(handle_health))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Live member entry
#[derive(Debug, Serialize)]
pub struct LiveNode {
    pub id: String,
    pub address: String,
}

/// Cluster info response
#[derive(Debug, Serialize)]
pub struct ClusterInfoResponse {
    pub node_id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub live_nodes: Vec<LiveNode>,
    pub epoch: u64,
}

/// Registered node with its current status
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub address: String,
    pub live: bool,
    pub leader: bool,
}

/// Stored record
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub index: u64,
    pub epoch: u64,
    pub leader_id: String,
    pub accepted_at: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Accepted write response
#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub message: String,
    pub index: u64,
    pub epoch: u64,
    pub replicating_to: Vec<String>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
    pub epoch: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
}

fn error_response(status: StatusCode, error: String, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
            leader_id: None,
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_cluster_info(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let view = state.cluster.view();

    Json(ClusterInfoResponse {
        node_id: view.self_id.clone(),
        is_leader: view.is_leader(),
        leader_id: view.leader_id.clone(),
        live_nodes: view
            .live
            .iter()
            .map(|(id, address)| LiveNode {
                id: id.clone(),
                address: address.clone(),
            })
            .collect(),
        epoch: view.epoch,
    })
}

async fn handle_nodes(
    State(state): State<Arc<AppState>>,
) -> Response {
    let view = state.cluster.view();

    match state.cluster.registered_nodes().await {
        Ok(nodes) => {
            let nodes: Vec<NodeStatus> = nodes
                .into_iter()
                .map(|node| NodeStatus {
                    live: view.is_live(&node.id),
                    leader: view.leader_id.as_deref() == Some(node.id.as_str()),
                    id: node.id,
                    address: node.address,
                })
                .collect();
            Json(nodes).into_response()
        }
        Err(e) => {
            tracing::warn!("Failed to list registered nodes: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), "STORE_UNAVAILABLE")
        }
    }
}

async fn handle_list_records(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let records: Vec<RecordResponse> = state
        .coordinator
        .log()
        .records()
        .await
        .into_iter()
        .map(|record| RecordResponse {
            index: record.index,
            epoch: record.epoch,
            payload: serde_json::from_slice(&record.payload).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&record.payload).into_owned())
            }),
            leader_id: record.leader_id,
            accepted_at: record.accepted_at,
        })
        .collect();

    Json(records)
}

async fn handle_put_record(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON body: {}", e),
            "BAD_REQUEST",
        );
    }

    match state.coordinator.handle_write(body.to_vec()).await {
        WriteOutcome::Accepted(write) => {
            let index = write.index;
            let fanout = write.fanout;
            tokio::spawn(async move {
                match fanout.reports().await {
                    Ok(reports) => {
                        let delivered = reports
                            .iter()
                            .filter(|r| r.status == SendStatus::Delivered)
                            .count();
                        tracing::debug!(
                            "Record {} delivered to {}/{} followers",
                            index,
                            delivered,
                            reports.len()
                        );
                    }
                    Err(e) => tracing::warn!("Record {} fan-out ended abnormally: {}", index, e),
                }
            });

            (
                StatusCode::CREATED,
                Json(WriteResponse {
                    message: "Record accepted".to_string(),
                    index: write.index,
                    epoch: write.epoch,
                    replicating_to: write.targets,
                }),
            )
                .into_response()
        }
        WriteOutcome::Rejected(reason) => {
            let leader_id = match reason {
                crate::replication::RejectReason::NotLeader { ref leader_id } => leader_id.clone(),
            };
            (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: reason.code().to_string(),
                    code: "NOT_LEADER".to_string(),
                    leader_id,
                }),
            )
                .into_response()
        }
    }
}

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let view = state.cluster.view();
    Json(HealthResponse {
        healthy: true,
        node_id: view.self_id.clone(),
        is_leader: view.is_leader(),
        epoch: view.epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::agent::ClusterAgent;
    use crate::config::CoordinationConfig;
    use crate::replication::{Message, RecordLog, ReplicationTransport};
    use crate::state::NodeIdentity;
    use crate::store::MemoryCoordinator;

    /// Accepts every write without a network
    struct AckAll;

    #[async_trait::async_trait]
    impl ReplicationTransport for AckAll {
        async fn replicate(&self, address: &str, _message: Message) -> Result<Message> {
            Ok(Message::ReplicateAck {
                node_id: address.to_string(),
                index: 0,
                accepted: true,
                reason: None,
            })
        }
    }

    async fn node(hub: &MemoryCoordinator, id: &str) -> Arc<AppState> {
        let cluster = Arc::new(
            ClusterAgent::start(
                NodeIdentity::new(id, format!("{}.test:7654", id)),
                Arc::new(hub.clone()),
                CoordinationConfig::default(),
            )
            .await
            .unwrap(),
        );
        let coordinator = Arc::new(ReplicationCoordinator::new(
            id.to_string(),
            cluster.reader(),
            Arc::new(RecordLog::new()),
            Arc::new(AckAll),
            Duration::from_secs(1),
        ));
        Arc::new(AppState { cluster, coordinator })
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = HttpServer::create_router(Arc::clone(state), false)
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn two_nodes() -> (Arc<AppState>, Arc<AppState>) {
        let hub = MemoryCoordinator::new();
        let leader = node(&hub, "n1").await;
        let follower = node(&hub, "n2").await;

        let mut reader = leader.cluster.reader();
        tokio::time::timeout(Duration::from_secs(5), reader.wait_for(|v| v.live.len() == 2))
            .await
            .unwrap()
            .unwrap();
        (leader, follower)
    }

    #[tokio::test]
    async fn test_cluster_info_reports_view() {
        let (leader, _follower) = two_nodes().await;

        let (status, body) = call(&leader, "GET", "/cluster-info", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "n1");
        assert_eq!(body["is_leader"], true);
        assert_eq!(body["leader_id"], "n1");
        assert_eq!(body["live_nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_leader_accepts_record() {
        let (leader, _follower) = two_nodes().await;

        let (status, body) = call(&leader, "PUT", "/records", r#"{"name":"grace"}"#).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["index"], 1);
        assert_eq!(body["replicating_to"], serde_json::json!(["n2"]));

        let (status, body) = call(&leader, "GET", "/records", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["payload"]["name"], "grace");
    }

    #[tokio::test]
    async fn test_follower_refuses_record() {
        let (_leader, follower) = two_nodes().await;
        let mut reader = follower.cluster.reader();
        tokio::time::timeout(Duration::from_secs(5), reader.wait_for(|v| v.leader_id.is_some()))
            .await
            .unwrap()
            .unwrap();

        let (status, body) = call(&follower, "PUT", "/records", r#"{"name":"grace"}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not-leader");
        assert_eq!(body["code"], "NOT_LEADER");
        assert_eq!(body["leader_id"], "n1");
        assert!(follower.coordinator.log().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let (leader, _follower) = two_nodes().await;

        let (status, body) = call(&leader, "PUT", "/records", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(leader.coordinator.log().is_empty().await);
    }

    #[tokio::test]
    async fn test_nodes_lists_registrations() {
        let (leader, follower) = two_nodes().await;
        follower.cluster.shutdown().await;
        let mut reader = leader.cluster.reader();
        tokio::time::timeout(Duration::from_secs(5), reader.wait_for(|v| v.live.len() == 1))
            .await
            .unwrap()
            .unwrap();

        let (status, body) = call(&leader, "GET", "/cluster/nodes", "").await;
        assert_eq!(status, StatusCode::OK);
        let nodes = body.as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["id"], "n1");
        assert_eq!(nodes[0]["leader"], true);
        assert_eq!(nodes[1]["id"], "n2");
        assert_eq!(nodes[1]["live"], false);
    }
}
