/// Blob backend error taxonomy
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// Key is unknown to the backend
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Backend could not be reached or timed out
    #[error("blob backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the operation (bad key, permissions)
    #[error("blob access denied: {0}")]
    Denied(String),

    /// The caller's cancellation token fired
    #[error("blob operation cancelled")]
    Cancelled,

    #[error("blob backend error: {0}")]
    Internal(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

impl BlobError {
    /// Classify a local I/O error observed while touching `key`
    pub fn from_io(key: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
            ErrorKind::PermissionDenied => BlobError::Denied(format!("{}: {}", key, err)),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                BlobError::Unavailable(format!("{}: {}", key, err))
            }
            _ => BlobError::Internal(format!("{}: {}", key, err)),
        }
    }

    /// Worth retrying the same operation
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_classification() {
        let err = BlobError::from_io("k", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err, BlobError::NotFound("k".into()));

        let err = BlobError::from_io("k", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, BlobError::Denied(_)));

        let err = BlobError::from_io("k", io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_transient());

        let err = BlobError::from_io("k", io::Error::other("disk on fire"));
        assert!(matches!(err, BlobError::Internal(_)));
        assert!(!err.is_transient());
    }
}
