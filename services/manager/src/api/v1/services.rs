//! Service endpoints.
//!
//! Services are addressed by ID or by name. Every update produces a new
//! immutable version; the response always carries the current one.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::model::{ServiceSpec, ServiceVersion};
use crate::reconciler::Task;
use crate::state::AppState;

/// /v1/services
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services).post(create_service))
        .route(
            "/{service}",
            get(get_service).put(update_service).delete(delete_service),
        )
        .route("/{service}/tasks", get(list_service_tasks))
        .route("/{service}/status", get(get_service_status))
}

#[derive(Debug, Serialize)]
pub struct ListServicesResponse {
    pub items: Vec<ServiceVersion>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub items: Vec<Task>,
}

async fn create_service(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state.manager().create_service(spec).await?;
    tracing::info!(
        service_id = %version.service_id,
        name = %version.name(),
        replicas = version.replicas(),
        "Service created"
    );
    Ok((StatusCode::CREATED, Json(ServiceVersion::clone(&version))))
}

async fn list_services(State(state): State<AppState>) -> Json<ListServicesResponse> {
    let items = state
        .manager()
        .store()
        .list_services()
        .iter()
        .map(|v| v.as_ref().clone())
        .collect();
    Json(ListServicesResponse { items })
}

async fn get_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceVersion>, ApiError> {
    let version = state.manager().store().find_service(&service)?;
    Ok(Json(ServiceVersion::clone(&version)))
}

async fn update_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(spec): Json<ServiceSpec>,
) -> Result<Json<ServiceVersion>, ApiError> {
    let manager = state.manager();
    let current = manager.store().find_service(&service)?;
    let version = manager.update_service(current.service_id, spec).await?;
    tracing::info!(
        service_id = %version.service_id,
        version = version.version,
        "Service updated"
    );
    Ok(Json(ServiceVersion::clone(&version)))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<StatusCode, ApiError> {
    let manager = state.manager();
    let current = manager.store().find_service(&service)?;
    manager.delete_service(current.service_id).await?;
    tracing::info!(service_id = %current.service_id, "Service deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_service_tasks(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let manager = state.manager();
    let current = manager.store().find_service(&service)?;
    let items = manager.service_tasks(&current.service_id)?;
    Ok(Json(ListTasksResponse { items }))
}

async fn get_service_status(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.manager();
    let current = manager.store().find_service(&service)?;
    Ok(Json(manager.service_status(&current.service_id)?))
}
