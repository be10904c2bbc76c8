use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::cluster::ClusterError;
use crate::store::StoreError;

/// RFC 7807 problem body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://convoy.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            details: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            problem: Box::new(ProblemDetails::new(status, code, message)),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Validation { field, message: reason } => {
                ApiError::bad_request("validation_error", message)
                    .with_details(vec![FieldError { field, message: reason }])
            }
            StoreError::Conflict { kind, .. } => {
                ApiError::conflict(format!("{kind}_name_conflict"), message)
            }
            StoreError::InUse { .. } => ApiError::conflict("secret_in_use", message),
            StoreError::NotFound { kind, .. } => {
                ApiError::not_found(format!("{kind}_not_found"), message)
            }
            StoreError::Seal(e) => {
                tracing::error!(error = %e, "Secret sealing failed");
                ApiError::internal("internal_error", "Secret storage failure")
            }
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::UnknownNode(_) => ApiError::not_found("node_not_found", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StoreError::validation("name", "must not be empty"), StatusCode::BAD_REQUEST)]
    #[case(StoreError::Conflict { kind: "service", name: "web".into() }, StatusCode::CONFLICT)]
    #[case(StoreError::InUse { name: "db".into(), services: vec![], tasks: 2 }, StatusCode::CONFLICT)]
    #[case(StoreError::NotFound { kind: "secret", id: "x".into() }, StatusCode::NOT_FOUND)]
    fn test_store_error_status(#[case] err: StoreError, #[case] expected: StatusCode) {
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), expected);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static("application/problem+json")
        );
    }

    #[test]
    fn test_validation_carries_field() {
        let err = ApiError::from(StoreError::validation("mounts[0].target", "must be absolute"));
        assert_eq!(err.problem.code, "validation_error");
        let details = err.problem.details.unwrap();
        assert_eq!(details[0].field, "mounts[0].target");
    }
}
