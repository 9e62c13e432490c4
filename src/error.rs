/// Unified error types for Trove
use crate::blob_store::BlobError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum TroveError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Caller is authenticated but not allowed to perform the action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record exists but belongs to someone else. Surfaces as 404.
    #[error("Access denied: {0}")]
    Denied(String),

    /// Conflict errors (unique index violations)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upload exceeded the configured byte budget
    #[error("File exceeds the maximum upload size of {limit} bytes")]
    FileTooLarge { limit: u64 },

    /// Upload would exceed the owner's storage quota
    #[error("Storage quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// Blob backend could not be reached
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl TroveError {
    /// HTTP status and machine-readable code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            TroveError::Authentication(_) => (StatusCode::UNAUTHORIZED, "AuthenticationRequired"),
            TroveError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            TroveError::Validation(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            // Denied is reported as NotFound so ids cannot be enumerated
            TroveError::NotFound(_) | TroveError::Denied(_) => (StatusCode::NOT_FOUND, "NotFound"),
            TroveError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            TroveError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "FileTooLarge"),
            TroveError::QuotaExceeded { .. } => {
                (StatusCode::INSUFFICIENT_STORAGE, "QuotaExceeded")
            }
            TroveError::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "BackendUnavailable")
            }
            TroveError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "Cancelled"),
            TroveError::Database(_) | TroveError::Io(_) | TroveError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError")
            }
        }
    }

    /// Map a unique-index violation to `Conflict`, anything else to `Database`
    pub fn conflict_on_unique(err: sqlx::Error, message: impl Into<String>) -> Self {
        if is_unique_violation(&err) {
            TroveError::Conflict(message.into())
        } else {
            TroveError::Database(err)
        }
    }
}

/// True when the database rejected a write because of a unique index
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl From<BlobError> for TroveError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(key) => TroveError::NotFound(format!("blob {}", key)),
            BlobError::Unavailable(msg) => TroveError::BackendUnavailable(msg),
            BlobError::Denied(msg) => TroveError::Denied(msg),
            BlobError::Cancelled => TroveError::Cancelled,
            BlobError::Internal(msg) => TroveError::Internal(msg),
        }
    }
}

/// Convert TroveError to HTTP response
impl IntoResponse for TroveError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            TroveError::Database(_) | TroveError::Io(_) | TroveError::Internal(_) => {
                // The request span carries the request id
                tracing::error!(error = %self, "internal error");
                "Internal server error".to_string() // Don't leak details
            }
            TroveError::Denied(_) => "Not found".to_string(),
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for Trove operations
pub type TroveResult<T> = Result<T, TroveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TroveError::FileTooLarge { limit: 10 }.status_and_code().0,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            TroveError::QuotaExceeded {
                requested: 4,
                available: 2
            }
            .status_and_code()
            .0,
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            TroveError::Denied("file 7".into()).status_and_code().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TroveError::Conflict("dup".into()).status_and_code().0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            TroveError::BackendUnavailable("down".into()).status_and_code().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_blob_error_conversion() {
        let err: TroveError = BlobError::NotFound("abc".into()).into();
        assert!(matches!(err, TroveError::NotFound(_)));

        let err: TroveError = BlobError::Unavailable("timeout".into()).into();
        assert!(matches!(err, TroveError::BackendUnavailable(_)));

        let err: TroveError = BlobError::Denied("bad key".into()).into();
        assert!(matches!(err, TroveError::Denied(_)));
    }

    #[test]
    fn test_denied_body_hides_reason() {
        let response = TroveError::Denied("file 42 belongs to user 3".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
