use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::engine::EngineError;
use crate::tenant::TenantError;

/// JSON error body: `{code, message, details?}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn timeout() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "timeout", "request took too long")
    }

    pub fn overloaded() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "overloaded", "too many requests in flight")
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) | EngineError::HasBookings(_) => {
                StatusCode::CONFLICT
            }
            EngineError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Unavailable(_) => {
                error!("storage failure: {err}");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let details = match &err {
            EngineError::Conflict(detail) => serde_json::to_value(detail).ok(),
            _ => None,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            details,
        }
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::InvalidName(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_tenant", err.to_string()),
            TenantError::TooMany => Self::new(StatusCode::BAD_REQUEST, "limit_exceeded", err.to_string()),
            TenantError::Io(_) => {
                error!("tenant load failed: {err}");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}
