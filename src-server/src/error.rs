//! Mapping of library errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use ocrflow::error::EnqueueError;
use ocrflow::identity::AuthError;

use crate::routes::ApiResponse;

/// Error returned by a handler, rendered in the response envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        let status = match &err {
            EnqueueError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EnqueueError::NotFound(_) => StatusCode::NOT_FOUND,
            EnqueueError::AlreadyProcessed { .. } | EnqueueError::InProgress { .. } => {
                StatusCode::CONFLICT
            }
            EnqueueError::Storage(_) | EnqueueError::Documents(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if err.is_transient() {
            log::error!("Request failed on storage: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::err(self.message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocrflow::db::DatabaseError;

    #[test]
    fn test_enqueue_error_status_mapping() {
        let cases = [
            (
                EnqueueError::InvalidRequest("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                EnqueueError::NotFound("doc".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                EnqueueError::AlreadyProcessed {
                    document_id: "doc".to_string(),
                    page: 1,
                },
                StatusCode::CONFLICT,
            ),
            (
                EnqueueError::InProgress {
                    document_id: "doc".to_string(),
                    page: 1,
                },
                StatusCode::CONFLICT,
            ),
            (
                EnqueueError::Storage(DatabaseError::LockPoisoned),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_auth_error_is_unauthorized() {
        assert_eq!(
            ApiError::from(AuthError::InvalidCredentials).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
