//! KV client errors

use thiserror::Error;

/// Errors that can occur when talking to the replicated key-value store
#[derive(Debug, Error)]
pub enum KvError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No endpoint could be reached
    #[error("KV store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error
    #[error("KV API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Compare-and-swap precondition failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Key not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lease expired or unknown
    #[error("Lease expired: {0}")]
    LeaseExpired(i64),

    /// Deadline exceeded
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// Operation abandoned because the caller was cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl KvError {
    /// Transient connectivity failures; callers retry on the next interval
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KvError::Http(_) | KvError::Unavailable(_) | KvError::Timeout(_)
        )
    }
}
