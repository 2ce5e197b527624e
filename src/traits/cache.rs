//! Cache trait for the short-lived state this crate keeps locally
//!
//! Price memoization and pending subscription updates both live behind this
//! trait, so a deployment can back them with whatever shared store it runs.

use crate::error::{Result, SubsyncError};
use async_trait::async_trait;
use std::time::Duration;

/// Key-value cache with optional per-entry TTL
///
/// Values are JSON bytes so the trait stays object-safe; use [`CacheExt`]
/// for typed access.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a value as JSON bytes.
    ///
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store JSON bytes. `None` uses the backend's default TTL.
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete a value
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Typed helpers on top of [`Cache`]
#[async_trait]
pub trait CacheExt: Cache {
    /// Get and deserialize a value
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        match self.get_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SubsyncError::internal(format!("Failed to deserialize: {}", e))),
            None => Ok(None),
        }
    }

    /// Serialize and store a value
    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: serde::Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SubsyncError::internal(format!("Failed to serialize: {}", e)))?;
        self.set_bytes(key, bytes, ttl).await
    }
}

impl<T: Cache + ?Sized> CacheExt for T {}

#[async_trait]
impl<T: Cache + ?Sized> Cache for std::sync::Arc<T> {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get_bytes(key).await
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        (**self).set_bytes(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
