//! Nodemanager HTTP service
//!
//! Exposes the pool over REST:
//! - Nodes: list, summary, hosts, add, remove, reset
//! - Allocation: available, allocate, deallocate, exchange
//! - Cache: refresh

pub mod handlers;
pub mod resources;
pub mod state;

pub use resources::{
    AddNodesRequest, DeallocateRequest, ListQuery, OperationStatus, PoolResponse,
    RemoveNodesRequest, ResetRequest, ResourceList,
};
pub use state::NodeManagerState;

use axum::{
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Requests served at once; mutating calls serialize on the pool lock anyway
const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Method, path and description of every route, for startup logs
pub const ROUTES: &[(&str, &str, &str)] = &[
    ("GET", "/health", "Health check"),
    ("GET", "/v1/nodes", "List nodes (?consumer=&pattern=)"),
    ("GET", "/v1/nodes/summary", "Per-type usage summary"),
    ("GET", "/v1/hosts", "Nodes by host and simulation"),
    ("POST", "/v1/nodes/add", "Add nodes to the pool"),
    ("POST", "/v1/nodes/remove", "Remove nodes from the pool"),
    ("POST", "/v1/nodes/reset", "Clear ownership of inactive consumers"),
    ("POST", "/v1/nodes/available", "Eligible nodes for a request"),
    ("POST", "/v1/nodes/allocate", "Allocate nodes to a consumer"),
    ("POST", "/v1/nodes/deallocate", "Release a consumer's nodes"),
    ("POST", "/v1/nodes/exchange", "Deallocate then allocate"),
    ("POST", "/v1/cache/refresh", "Reload the node cache"),
];

/// Create the nodemanager router
pub fn create_nodemanager_router(state: NodeManagerState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Reads
        .route("/v1/nodes", get(handlers::list_nodes))
        .route("/v1/nodes/summary", get(handlers::summary))
        .route("/v1/hosts", get(handlers::hosts))
        .route("/v1/nodes/available", post(handlers::available_nodes))
        // Inventory
        .route("/v1/nodes/add", post(handlers::add_nodes))
        .route("/v1/nodes/remove", post(handlers::remove_nodes))
        .route("/v1/nodes/reset", post(handlers::reset_nodes))
        // Allocation
        .route("/v1/nodes/allocate", post(handlers::allocate))
        .route("/v1/nodes/deallocate", post(handlers::deallocate))
        .route("/v1/nodes/exchange", post(handlers::exchange))
        // Cache
        .route("/v1/cache/refresh", post(handlers::refresh_cache))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::{NodeDescriptor, NodePool};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn create_test_state() -> NodeManagerState {
        let pool = NodePool::from_config(&PoolConfig::in_memory().with_seed(5)).unwrap();
        NodeManagerState::new(pool)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed(state: &NodeManagerState, count: usize) {
        let nodes = (0..count)
            .map(|i| NodeDescriptor {
                id: Some(format!("LTE{:02}", i)),
                node_type: Some("ERBS".to_string()),
                host: Some(format!("netsim-{}", i % 2)),
                ..Default::default()
            })
            .collect();
        state.pool.add(nodes, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_nodemanager_router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let state = create_test_state();
        seed(&state, 3).await;
        let app = create_nodemanager_router(state);

        let response = app
            .oneshot(Request::builder().uri("/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "NodeList");
        assert_eq!(body["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_unmatched_pattern_is_not_found() {
        let state = create_test_state();
        seed(&state, 1).await;
        let app = create_nodemanager_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/nodes?pattern=CORE*")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_allocate_and_conflict() {
        let state = create_test_state();
        seed(&state, 2).await;
        let app = create_nodemanager_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/nodes/allocate",
                json!({ "consumer": "FM_01", "num_nodes": { "ERBS": 2 }, "exclusive": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["state"], "SATISFIED");

        let response = app
            .oneshot(post_json(
                "/v1/nodes/allocate",
                json!({ "consumer": "PM_02", "num_nodes": { "ERBS": 1 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_request_is_bad_request() {
        let app = create_nodemanager_router(create_test_state());
        let response = app
            .oneshot(post_json(
                "/v1/nodes/allocate",
                json!({ "consumer": "", "num_nodes": { "ERBS": 1 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_remove_requires_selector() {
        let app = create_nodemanager_router(create_test_state());
        let response = app
            .oneshot(post_json("/v1/nodes/remove", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_deallocation_is_accepted() {
        let state = create_test_state();
        let _running = state.begin_deallocation("FM_01");
        let app = create_nodemanager_router(state);

        let response = app
            .oneshot(post_json("/v1/nodes/deallocate", json!({ "consumer": "FM_01" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("already in progress"));
    }

    #[tokio::test]
    async fn test_refresh_cache_reports_count() {
        let state = create_test_state();
        seed(&state, 4).await;
        let app = create_nodemanager_router(state);

        let response = app
            .oneshot(post_json("/v1/cache/refresh", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["details"]["nodes"], 4);
    }
}
