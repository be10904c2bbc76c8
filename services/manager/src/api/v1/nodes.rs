//! Node endpoints.
//!
//! Nodes join in process through `Manager::register_node`; over HTTP they can
//! be listed, inspected and have their availability changed.

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use convoy_id::NodeId;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::cluster::{Availability, NodeInfo};
use crate::reconciler::Task;
use crate::state::AppState;

/// /v1/nodes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/tasks", get(list_node_tasks))
        .route("/{node_id}/availability", put(set_availability))
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeInfo>,
}

#[derive(Debug, Serialize)]
pub struct ListNodeTasksResponse {
    pub items: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct SetAvailabilityRequest {
    pub availability: Availability,
}

fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_node_id", "Invalid node ID format"))
}

async fn list_nodes(State(state): State<AppState>) -> Json<ListNodesResponse> {
    Json(ListNodesResponse {
        items: state.manager().nodes().list().await,
    })
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeInfo>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    state
        .manager()
        .nodes()
        .get(&node_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("node_not_found", format!("node '{node_id}' not found")))
}

async fn list_node_tasks(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<ListNodeTasksResponse>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let manager = state.manager();
    if manager.nodes().get(&node_id).await.is_none() {
        return Err(ApiError::not_found(
            "node_not_found",
            format!("node '{node_id}' not found"),
        ));
    }
    Ok(Json(ListNodeTasksResponse {
        items: manager.projection().node_tasks(&node_id),
    }))
}

async fn set_availability(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<SetAvailabilityRequest>,
) -> Result<Json<NodeInfo>, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let info = state
        .manager()
        .set_node_availability(&node_id, req.availability)
        .await?;
    tracing::info!(node_id = %node_id, availability = ?info.availability, "Node availability changed");
    Ok(Json(info))
}
