use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::TrackError;

/// Error body returned by every HTTP endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRange(String),
    NotFound(String),
    Unauthorized(&'static str, String),
    Internal(String),
}

impl From<TrackError> for ApiError {
    fn from(err: TrackError) -> Self {
        match err {
            TrackError::BadRange(msg) => ApiError::BadRange(msg),
            TrackError::AuthInvalid | TrackError::AuthUnknown => {
                ApiError::Unauthorized(err.code(), err.to_string())
            }
            TrackError::StoreUnavailable(_) => ApiError::Internal(err.to_string()),
            other => ApiError::BadRange(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRange(msg) => (StatusCode::BAD_REQUEST, "BadRange", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg),
            ApiError::Unauthorized(code, msg) => (StatusCode::UNAUTHORIZED, code, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "StoreUnavailable", msg),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
