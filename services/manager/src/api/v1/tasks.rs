//! Task endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use convoy_id::TaskId;

use crate::api::error::ApiError;
use crate::reconciler::Task;
use crate::state::AppState;

/// /v1/tasks
pub fn routes() -> Router<AppState> {
    Router::new().route("/{task_id}", get(get_task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid_task_id", "Invalid task ID format"))?;
    Ok(Json(state.manager().task(&task_id)?))
}
