//! Registry error types

use axum::extract::rejection::{BytesRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors returned by the master registry API
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn status(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let message = match self {
            RegistryError::Internal(ref detail) => {
                error!("Request failed: {}", detail);
                "Internal server error".to_string()
            }
            ref other => other.to_string(),
        };
        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}

impl From<PathRejection> for RegistryError {
    fn from(rejection: PathRejection) -> Self {
        RegistryError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for RegistryError {
    fn from(rejection: QueryRejection) -> Self {
        RegistryError::InvalidRequest(rejection.body_text())
    }
}

impl From<BytesRejection> for RegistryError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            RegistryError::PayloadTooLarge(rejection.body_text())
        } else {
            RegistryError::InvalidRequest(rejection.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RegistryError::NotFound("Server not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RegistryError::InvalidRequest("code required".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RegistryError::PayloadTooLarge("too big".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            RegistryError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
