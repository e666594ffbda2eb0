//! KvStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Error type for store operations
///
/// Every variant is a transient infrastructure failure from the caller's
/// point of view. Reads may degrade around it; writes must surface it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached or answered with a server error
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store rejected the call because of rate limiting
    #[error("store rate limited")]
    RateLimited,

    /// Call did not complete in time
    #[error("store call timed out")]
    Timeout,

    /// Unexpected HTTP status from a remote store
    #[error("store returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::RateLimited | Self::Timeout => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Serialization(_) => false,
        }
    }
}

/// Remote key-value store with TTL expiry and prefix enumeration
///
/// The store offers no transactions and no conditional writes. Each call is
/// an independent single-key operation, and `list` is eventually consistent
/// and may be slow or rate limited.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Absent and expired keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate all live keys starting with `prefix`, in store order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put(key, raw, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::RateLimited.is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Http {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!StoreError::Http {
            status: 403,
            message: String::new()
        }
        .is_transient());
        assert!(!StoreError::Serialization("bad".into()).is_transient());
    }
}
