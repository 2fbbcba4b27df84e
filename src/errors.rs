use crate::services::{
    classifier::ClassificationError, counter::CounterError, document_store::DocumentStoreError,
    fan_out::FanOutError, storage_service::StorageError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Everything that can end a trigger invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("classification service error: {0}")]
    Classification(#[from] ClassificationError),
    #[error("storage I/O error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    FanOut(#[from] FanOutError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("move record `{0}` has no usable `mover` field")]
    InvalidMoveRecord(String),
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StorageError::InvalidBucketName { .. } | StorageError::InvalidObjectKey => {
                StatusCode::BAD_REQUEST
            }
            StorageError::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!(error = %err, "storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<DocumentStoreError> for AppError {
    fn from(err: DocumentStoreError) -> Self {
        match &err {
            DocumentStoreError::AlreadyExists(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            DocumentStoreError::Sqlx(_) => {
                tracing::error!(error = %err, "document store failure");
                AppError::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_http_statuses() {
        let cases = [
            (StorageError::BucketNotFound("b".into()), StatusCode::NOT_FOUND),
            (StorageError::InvalidObjectKey, StatusCode::BAD_REQUEST),
            (
                StorageError::BucketAlreadyExists("b".into()),
                StatusCode::CONFLICT,
            ),
            (
                StorageError::Io(std::io::Error::other("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
