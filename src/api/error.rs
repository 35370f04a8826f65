//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;

/// Internal server error message.
const INTERNAL_ERROR_MESSAGE: &str =
    "an internal server error occurred; contact the system administrator for more information";

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No job exists with the requested id.
    #[error("job not found")]
    JobNotFound,

    /// The request body failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store or container driver failed.
    #[error("internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<crate::db::DatabaseError> for Error {
    fn from(error: crate::db::DatabaseError) -> Self {
        match error {
            crate::db::DatabaseError::Validation(message) => Error::InvalidRequest(message),
            other => Error::Internal(anyhow::Error::from(other)),
        }
    }
}

impl From<crate::scheduler::SchedulerError> for Error {
    fn from(error: crate::scheduler::SchedulerError) -> Self {
        match error {
            crate::scheduler::SchedulerError::Store(inner) => inner.into(),
            crate::scheduler::SchedulerError::Driver(inner) => {
                Error::Internal(anyhow::Error::from(inner))
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::JobNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from(INTERNAL_ERROR_MESSAGE),
            ),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
