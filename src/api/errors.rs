use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::authority_client::AuthorityError;
use crate::session::machine::SessionError;
use crate::tasks::registry::LaunchError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    ServiceUnavailable(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::EmptyQuestionId => ApiError::BadRequest(err.to_string()),
            SessionError::NotAccepting { .. } | SessionError::AlreadyRunning(_) => {
                ApiError::Conflict(err.to_string())
            }
            SessionError::Stopped => ApiError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Session(err) => err.into(),
            LaunchError::Authority(AuthorityError::Rejected(reason)) => ApiError::Conflict(reason),
            LaunchError::Authority(AuthorityError::Transient(reason)) => {
                tracing::warn!(error = %reason, "Exam authority unavailable");
                ApiError::BadGateway(format!("exam authority unavailable: {reason}"))
            }
            LaunchError::Finished(_) => ApiError::Conflict(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
        };
        (status, Json(ErrorResponse { status: status.as_u16(), detail })).into_response()
    }
}
