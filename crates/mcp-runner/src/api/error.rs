use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session stopped: {0}")]
    SessionStopped(String),

    #[error("Invalid JSON-RPC message: {0}")]
    Parse(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::SessionStopped(_) => "SESSION_STOPPED",
            ApiError::Parse(_) => "PARSE_ERROR",
            ApiError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionStopped(_) => StatusCode::GONE,
            ApiError::Parse(_) => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::NotFound(id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::NotFound("s".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::SessionStopped("s".into()).into_response().status(),
            StatusCode::GONE
        );
        assert_eq!(
            ApiError::Parse("eof".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::MethodNotAllowed("PUT".into())
                .into_response()
                .status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_session_error_conversion() {
        let err: ApiError = SessionError::NotFound("ses_1".into()).into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
