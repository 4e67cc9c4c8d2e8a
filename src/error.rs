//! Error taxonomy and the HTTP error surface.
//!
//! Failures inside a provisioning run never cross the HTTP boundary as
//! errors: each step converts its failure into a state transition plus a
//! log entry. `ApiError` covers the synchronous request failures only.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("image build failed: {0}")]
    BuildFailed(String),
    #[error("container start failed: {0}")]
    RunFailed(String),
    #[error("reverse proxy wiring failed: {0}")]
    ProxyWireFailed(String),
    #[error("edge wiring failed: {0}")]
    EdgeWireFailed(String),
    #[error("no ports available in the configured range")]
    NoPortsAvailable,
    #[error("subdomain {0} is already in use")]
    ConflictingSubdomain(String),
    #[error("deployment not found")]
    NotFound,
    #[error("teardown finished with failed steps")]
    TeardownPartialFailure,
    #[error("state store error: {0}")]
    Store(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Synchronous request failures, mapped onto status codes.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::ConflictingSubdomain(s) => {
                Self::Conflict(format!("subdomain {s} is already in use"))
            }
            ProvisionError::NoPortsAvailable => {
                Self::ServiceUnavailable("no ports available".to_string())
            }
            ProvisionError::NotFound => Self::NotFound("deployment".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing credentials".to_string(),
            ),
            Self::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{resource} not found"),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let err: ApiError = ProvisionError::ConflictingSubdomain("demo".to_string()).into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn exhausted_ports_map_to_503() {
        let err: ApiError = ProvisionError::NoPortsAvailable.into();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
    }
}
