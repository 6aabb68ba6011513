use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error raised by the authoritative object store.
///
/// These errors always propagate to the caller unchanged; the caching layer
/// never compensates for them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The object does not exist in the given bucket.
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    /// The bucket does not exist.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    /// A bucket or object name failed validation.
    ///
    /// This is rejected before any request is made to the backend.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// The backend denied access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The backend did not answer in time.
    #[error("storage request timed out after {0:?}")]
    Timeout(Duration),
    /// A backend-specific failure, e.g. a 5xx response or connection loss.
    #[error("storage error: {0}")]
    Remote(String),
    /// An unexpected local error, e.g. filesystem access on the backend side.
    #[error("internal storage error")]
    Internal,
}

impl From<io::Error> for StorageError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "storage io error");
        Self::Internal
    }
}

impl From<serde_json::Error> for StorageError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "storage serialization error");
        Self::Internal
    }
}
