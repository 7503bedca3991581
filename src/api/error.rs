// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP mapping for [`CoreError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::error::CoreError;

#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    /// Malformed request the core never saw
    BadRequest(String),
    /// The request deadline passed; the operation future was dropped
    Timeout,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn status_of(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CoreError::NoTenant | CoreError::InvalidReference(_) => StatusCode::BAD_REQUEST,
        CoreError::Inactive | CoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Conflict { .. } => StatusCode::CONFLICT,
        CoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::IdExhausted { .. } | CoreError::Incompatible { .. } | CoreError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Core(err) => {
                let status = status_of(&err);
                if status.is_server_error() {
                    error!(kind = err.kind(), error = %err, "request failed");
                }
                crate::metrics::record_error("api", "request", err.kind());
                (status, err.kind(), err.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Timeout => {
                warn!("request deadline exceeded");
                crate::metrics::record_error("api", "request", "timeout");
                (StatusCode::SERVICE_UNAVAILABLE, "timeout", "request deadline exceeded".to_string())
            }
        };
        (status, Json(json!({ "success": false, "error": kind, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{Action, Section};

    #[test]
    fn test_status_table() {
        let cases = [
            (CoreError::Unauthenticated, 401),
            (CoreError::NoTenant, 400),
            (CoreError::Inactive, 403),
            (CoreError::Forbidden { section: Section::Billing, action: Action::Edit }, 403),
            (CoreError::not_found("patient", 7), 404),
            (CoreError::Conflict { field: "email".into() }, 409),
            (CoreError::InvalidReference("patient_id".into()), 400),
            (CoreError::Validation("name".into()), 422),
            (CoreError::IdExhausted { prefix: "MRN", year: 2025 }, 500),
            (CoreError::Unavailable("db".into()), 503),
            (CoreError::Incompatible { table: "patients".into(), column: "x".into() }, 500),
            (CoreError::Internal("boom".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(status_of(&err).as_u16(), code, "{err}");
        }
    }

    #[test]
    fn test_bad_request_and_timeout() {
        assert_eq!(ApiError::BadRequest("x".into()).into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Timeout.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
