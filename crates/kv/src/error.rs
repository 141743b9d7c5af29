//! Error types for the KV adapter.

use thiserror::Error;

/// KV store error taxonomy.
///
/// `NotReady` and `Transient` are retried by worker loops; `NotFound` is a
/// sentinel for expected absence and is never fatal to a request.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store is still loading")]
    NotReady,

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("not found")]
    NotFound,

    #[error("store error: {0}")]
    Backend(String),
}

impl KvError {
    /// Whether a caller should retry the operation in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady | Self::Transient(_))
    }
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;
        match err.kind() {
            ErrorKind::BusyLoadingError | ErrorKind::MasterDown => KvError::NotReady,
            ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::ClusterDown => {
                KvError::Transient(err.to_string())
            }
            _ => KvError::Backend(err.to_string()),
        }
    }
}

/// Result type alias for KV operations.
pub type KvResult<T> = std::result::Result<T, KvError>;
