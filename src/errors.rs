use crate::services::{blob_store::BlobError, error::CoreError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

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

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::ReadOnly(_) | CoreError::SourcesAreImmutable => StatusCode::FORBIDDEN,
            CoreError::DependentsExist { .. }
            | CoreError::StillReferenced(_)
            | CoreError::TooManyDependents { .. }
            | CoreError::ObjectImmutable(_) => StatusCode::CONFLICT,
            CoreError::InvalidGrammar(_) | CoreError::KeyDerivation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::EmptyPayload(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::StorageWriteFailed(blob) => {
                return AppError::from_blob(blob, err.to_string());
            }
            CoreError::MetadataWriteFailed(_) => {
                tracing::error!(error = %err, "metadata store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let message = err.to_string();
        AppError::from_blob(&err, message)
    }
}

impl AppError {
    fn from_blob(err: &BlobError, message: String) -> Self {
        let status = match err {
            BlobError::NotFound(_) => StatusCode::NOT_FOUND,
            BlobError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            BlobError::AlreadyExists(_) => StatusCode::CONFLICT,
            BlobError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            BlobError::Io(_) => {
                tracing::error!(error = %err, "blob store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::timerange::TimeRange, services::storage_keys::KeyError};
    use uuid::Uuid;

    #[test]
    fn core_errors_map_to_statuses() {
        let grammar = TimeRange::parse("nope").unwrap_err();
        let cases = [
            (CoreError::ReadOnly(Uuid::nil()), StatusCode::FORBIDDEN),
            (CoreError::SourcesAreImmutable, StatusCode::FORBIDDEN),
            (
                CoreError::StillReferenced("o".into()),
                StatusCode::CONFLICT,
            ),
            (
                CoreError::DependentsExist {
                    kind: "flow",
                    id: Uuid::nil(),
                    count: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::InvalidGrammar(grammar),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                CoreError::not_found("flow", Uuid::nil()),
                StatusCode::NOT_FOUND,
            ),
            (
                CoreError::StorageWriteFailed(BlobError::NotFound("k".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                CoreError::StorageWriteFailed(BlobError::AlreadyExists("k".into())),
                StatusCode::CONFLICT,
            ),
            (
                CoreError::KeyDerivation(KeyError::UnboundedStart("_".into())),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                CoreError::EmptyPayload("o".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
