//! Nodemanager endpoint handlers
//!
//! Pool errors map onto HTTP statuses in [`status_for`]; every failure body
//! is a [`PoolResponse`] or [`OperationStatus`] carrying the error text.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};

use super::resources::{
    AddNodesRequest, DeallocateRequest, ListQuery, OperationStatus, PoolResponse,
    RemoveNodesRequest, ResetRequest, ResourceList,
};
use super::state::NodeManagerState;
use crate::pool::{AllocationRequest, AttachError, NodeSelector, PoolError};

/// HTTP status for a pool error
pub fn status_for(err: &PoolError) -> StatusCode {
    match err {
        PoolError::NoResourceAvailable(_) | PoolError::InUse(_) | PoolError::AttachFailed { .. } => {
            StatusCode::CONFLICT
        }
        PoolError::NoMatchingNodes(_) | PoolError::Attach(AttachError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        PoolError::Attach(_) => StatusCode::CONFLICT,
        PoolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PoolError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: PoolError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Pool operation failed: {}", err);
    } else {
        warn!("Pool request rejected: {}", err);
    }
    (status, Json(PoolResponse::<()>::error(err.to_string()))).into_response()
}

fn ok<T: serde::Serialize>(result: T) -> Response {
    (StatusCode::OK, Json(PoolResponse::success(result))).into_response()
}

// ============================================================================
// Health & reads
// ============================================================================

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn list_nodes(
    State(state): State<NodeManagerState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let patterns = query.patterns();
    let nodes = if patterns.is_empty() {
        match &query.consumer {
            Some(consumer) => state.pool.allocated_nodes(consumer),
            None => state.pool.list(),
        }
    } else {
        state.pool.grep(&patterns).map(|nodes| match &query.consumer {
            Some(consumer) => nodes.into_iter().filter(|n| n.is_owned_by(consumer)).collect(),
            None => nodes,
        })
    };

    match nodes {
        Ok(nodes) => Json(ResourceList::new("NodeList", nodes)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn summary(State(state): State<NodeManagerState>) -> Response {
    match state.pool.summary() {
        Ok(summary) => Json(ResourceList::new("TypeSummaryList", summary)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn hosts(State(state): State<NodeManagerState>) -> Response {
    match state.pool.hosts_view() {
        Ok(view) => ok(view),
        Err(e) => error_response(e),
    }
}

pub async fn available_nodes(
    State(state): State<NodeManagerState>,
    Json(request): Json<AllocationRequest>,
) -> Response {
    match state.pool.available_nodes(&request) {
        Ok(nodes) => Json(ResourceList::new("NodeList", nodes)).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Inventory mutations
// ============================================================================

pub async fn add_nodes(
    State(state): State<NodeManagerState>,
    Json(body): Json<AddNodesRequest>,
) -> Response {
    match state.pool.add(body.nodes, body.validate).await {
        Ok(report) => ok(report),
        Err(e) => error_response(e),
    }
}

pub async fn remove_nodes(
    State(state): State<NodeManagerState>,
    Json(body): Json<RemoveNodesRequest>,
) -> Response {
    let result = if body.all {
        state.pool.remove_all(body.force).await
    } else if !body.ids.is_empty() {
        state.pool.remove(NodeSelector::Ids(body.ids), body.force).await
    } else if !body.patterns.is_empty() {
        state
            .pool
            .remove(NodeSelector::Patterns(body.patterns), body.force)
            .await
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(OperationStatus::failure("One of ids, patterns or all is required")),
        )
            .into_response();
    };

    match result {
        Ok(report) => ok(report),
        Err(e) => error_response(e),
    }
}

pub async fn reset_nodes(
    State(state): State<NodeManagerState>,
    Json(body): Json<ResetRequest>,
) -> Response {
    match state.pool.reset(body.active_consumers).await {
        Ok(count) => (
            StatusCode::OK,
            Json(OperationStatus::success("Node ownership reset").with_details(json!({ "nodes": count }))),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn refresh_cache(State(state): State<NodeManagerState>) -> Response {
    match state.pool.refresh_cache() {
        Ok(count) => (
            StatusCode::OK,
            Json(OperationStatus::success("Cache refreshed").with_details(json!({ "nodes": count }))),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Allocation
// ============================================================================

pub async fn allocate(
    State(state): State<NodeManagerState>,
    Json(request): Json<AllocationRequest>,
) -> Response {
    info!(consumer = %request.consumer, "Allocation requested");
    match state.pool.allocate(&request).await {
        Ok(outcome) => ok(outcome),
        Err(e) => error_response(e),
    }
}

pub async fn deallocate(
    State(state): State<NodeManagerState>,
    Json(body): Json<DeallocateRequest>,
) -> Response {
    if body.consumer.trim().is_empty() {
        return error_response(PoolError::InvalidRequest("consumer name is required".into()));
    }
    let Some(_ticket) = state.begin_deallocation(&body.consumer) else {
        return (
            StatusCode::ACCEPTED,
            Json(OperationStatus::success(format!(
                "Deallocation for '{}' already in progress",
                body.consumer
            ))),
        )
            .into_response();
    };

    let result = match &body.nodes {
        Some(ids) => state.pool.deallocate_unused(&body.consumer, ids).await,
        None => state.pool.deallocate(&body.consumer).await,
    };
    match result {
        Ok(report) => ok(report),
        Err(e) => error_response(e),
    }
}

pub async fn exchange(
    State(state): State<NodeManagerState>,
    Json(request): Json<AllocationRequest>,
) -> Response {
    info!(consumer = %request.consumer, "Exchange requested");
    match state.pool.exchange(&request).await {
        Ok(outcome) => ok(outcome),
        Err(e) => error_response(e),
    }
}
