//! In-memory cache backed by moka
//!
//! Entries carry their own TTL: recurring price entries live for two hours,
//! pending subscription updates for as long as a checkout session is
//! expected to stay open.

use crate::config::CacheSettings;
use crate::error::Result;
use crate::traits::cache::Cache;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::time::{Duration, Instant};

/// Used when a caller stores a value without a TTL
const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    custom_ttl: Option<Duration>,
}

struct CacheExpiry {
    default_ttl: Duration,
}

impl Expiry<String, CacheEntry> for CacheExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.custom_ttl.unwrap_or(self.default_ttl))
    }

    fn expire_after_read(
        &self,
        _key: &String,
        _value: &CacheEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        // Reads never extend a price entry
        duration_until_expiry
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.custom_ttl.unwrap_or(self.default_ttl))
    }
}

/// Bounded in-memory cache with per-entry expiry
///
/// # Example
///
/// ```rust,ignore
/// use stripe_subsync::cache::InMemoryCache;
/// use stripe_subsync::traits::CacheExt;
///
/// let cache = InMemoryCache::new(10_000);
/// cache.set("price_data_quote_42", &entry, Some(Duration::from_secs(7200))).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryCache {
    inner: MokaCache<String, CacheEntry>,
}

impl InMemoryCache {
    /// Create a cache holding at most `max_entries` values
    pub fn new(max_entries: u64) -> Self {
        Self::with_ttl(max_entries, DEFAULT_TTL)
    }

    /// Create a cache with a custom default TTL
    pub fn with_ttl(max_entries: u64, default_ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(CacheExpiry { default_ttl })
            .build();

        Self { inner: cache }
    }

    /// Create a cache sized from configuration
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::with_ttl(settings.max_entries, settings.price_ttl())
    }

    /// Force pending eviction and expiration work
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Current number of entries
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry { value, custom_ttl: ttl };
        self.inner.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await;
        Ok(())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::cache::CacheExt;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Entry {
        price_id: String,
        unit_amount: i64,
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let cache = InMemoryCache::new(100);
        let entry = Entry { price_id: "price_1".to_string(), unit_amount: 1500 };
        cache.set("price_data_quote_1", &entry, None).await.unwrap();

        let value: Option<Entry> = cache.get("price_data_quote_1").await.unwrap();
        assert_eq!(value, Some(entry));
    }

    #[tokio::test]
    async fn test_entry_expires_after_its_own_ttl() {
        let cache = InMemoryCache::with_ttl(100, Duration::from_secs(60));
        cache
            .set("subscription_update_abc", &"pending", Some(Duration::from_millis(10)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.run_pending_tasks().await;

        let value: Option<String> = cache.get("subscription_update_abc").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_default_ttl_from_settings() {
        let settings = CacheSettings { price_ttl_seconds: 0, ..CacheSettings::default() };
        let cache = InMemoryCache::from_settings(&settings);
        cache.set("price_data_quote_1", &1, None).await.unwrap();
        cache.run_pending_tasks().await;

        let value: Option<i32> = cache.get("price_data_quote_1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = InMemoryCache::new(100);
        cache.set("key1", &"value1", None).await.unwrap();
        cache.delete("key1").await.unwrap();

        let value: Option<String> = cache.get("key1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_bounded_cache_does_not_grow_unbounded() {
        let cache = InMemoryCache::new(10);

        for i in 0..100 {
            cache
                .set(&format!("price_data_quote_{}", i), &i, None)
                .await
                .unwrap();
        }
        cache.run_pending_tasks().await;

        let size = cache.entry_count();
        assert!(size <= 15, "Cache should be bounded near max_entries, got {}", size);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_surface_as_error() {
        let cache = InMemoryCache::new(10);
        cache.set_bytes("broken", b"{not json".to_vec(), None).await.unwrap();

        let result: Result<Option<Entry>> = cache.get("broken").await;
        assert!(result.is_err());
    }
}
