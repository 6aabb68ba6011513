use std::io;

use thiserror::Error;

/// An error raised by the computation cache.
///
/// Producer failures and key errors are surfaced to the caller unchanged.
/// Cache-local I/O problems are collapsed into [`InternalError`](Self::InternalError)
/// after being logged; they never carry cache implementation details outward.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// `get` missed the cache for a seed that has no registered producer.
    #[error("no producer registered for seed `{0}`")]
    NoProducer(String),
    /// The registered producer failed to compute the entry.
    ///
    /// The attached string is the producer's own error message.
    #[error("producer failed: {0}")]
    Producer(String),
    /// An unexpected error inside the cache itself.
    #[error("internal cache error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}
