//! Secret endpoints.
//!
//! Payloads are accepted base64-encoded on create and never returned; reads
//! yield metadata only.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::Engine;

use crate::api::error::{ApiError, FieldError};
use crate::model::SecretMeta;
use crate::state::AppState;

/// /v1/secrets
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_secrets).post(create_secret))
        .route("/{secret}", get(get_secret).delete(delete_secret))
}

#[derive(Debug, serde::Deserialize)]
pub struct CreateSecretRequest {
    pub name: String,
    /// Base64-encoded payload.
    pub data: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ListSecretsResponse {
    pub items: Vec<SecretMeta>,
}

async fn create_secret(
    State(state): State<AppState>,
    Json(req): Json<CreateSecretRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(req.data.as_bytes())
        .map_err(|e| {
            ApiError::bad_request("invalid_secret_data", "Secret data must be base64")
                .with_details(vec![FieldError {
                    field: "data".to_string(),
                    message: e.to_string(),
                }])
        })?;

    let meta = state
        .manager()
        .create_secret(req.name, data, req.labels)
        .await?;
    tracing::info!(secret_id = %meta.id, name = %meta.name, "Secret created");
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn list_secrets(State(state): State<AppState>) -> Json<ListSecretsResponse> {
    Json(ListSecretsResponse {
        items: state.manager().store().list_secrets(),
    })
}

async fn get_secret(
    State(state): State<AppState>,
    Path(secret): Path<String>,
) -> Result<Json<SecretMeta>, ApiError> {
    Ok(Json(state.manager().store().find_secret(&secret)?))
}

async fn delete_secret(
    State(state): State<AppState>,
    Path(secret): Path<String>,
) -> Result<StatusCode, ApiError> {
    let manager = state.manager();
    let meta = manager.store().find_secret(&secret)?;
    manager.delete_secret(meta.id).await?;
    tracing::info!(secret_id = %meta.id, "Secret deleted");
    Ok(StatusCode::NO_CONTENT)
}
