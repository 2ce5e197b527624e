//! Memoized Stripe price creation.
//!
//! Prices are immutable in Stripe, so every distinct amount needs its own
//! price object. The cache remembers the last shape created for a key and
//! only asks Stripe for a new price when that shape changes. Concurrent misses
//! may create two prices for the same shape; the extra one is never used.

use super::client::StripePriceClient;
use super::remote::PriceShape;
use crate::error::Result;
use crate::traits::{Cache, CacheExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifetime of a memoized price.
pub const DEFAULT_PRICE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Cache key of the recurring price of a cart.
#[must_use]
pub fn recurring_key(cart_id: &str) -> String {
    format!("price_data_quote_{}", cart_id)
}

/// Cache key of the one-time initial charge of a cart.
#[must_use]
pub fn one_time_key(cart_id: &str) -> String {
    format!("price_data_quote_once_{}", cart_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedPrice {
    price_id: String,
    shape: PriceShape,
}

/// Creates Stripe prices at most once per key and shape.
pub struct PriceCache<K, P> {
    cache: K,
    client: P,
    ttl: Duration,
}

impl<K, P> PriceCache<K, P>
where
    K: Cache,
    P: StripePriceClient,
{
    pub fn new(cache: K, client: P) -> Self {
        Self {
            cache,
            client,
            ttl: DEFAULT_PRICE_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Return the price id for `shape`, creating it in Stripe when the cached
    /// entry is missing or differs in any field.
    pub async fn get_or_create_price(&self, key: &str, shape: &PriceShape) -> Result<String> {
        match self.cache.get::<CachedPrice>(key).await {
            Ok(Some(cached)) if cached.shape == *shape => {
                tracing::debug!(
                    target: "subsync::prices",
                    key = %key,
                    price_id = %cached.price_id,
                    "Reusing memoized price"
                );
                return Ok(cached.price_id);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    target: "subsync::prices",
                    key = %key,
                    error = %e,
                    "Unreadable price cache entry, creating a new price"
                );
            }
        }

        let price = self.client.create_price(shape).await?;

        let entry = CachedPrice {
            price_id: price.id.clone(),
            shape: shape.clone(),
        };
        if let Err(e) = self.cache.set(key, &entry, Some(self.ttl)).await {
            tracing::warn!(
                target: "subsync::prices",
                key = %key,
                error = %e,
                "Failed to memoize price"
            );
        }

        tracing::info!(
            target: "subsync::prices",
            key = %key,
            price_id = %price.id,
            unit_amount = shape.unit_amount,
            currency = %shape.currency,
            "Created price"
        );

        Ok(price.id)
    }

    /// Forget the memoized price of `key`.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::canonical::Interval;
    use crate::billing::client::test::MockStripeClient;
    use crate::billing::remote::{ProductData, RecurringParams};
    use crate::cache::InMemoryCache;

    fn shape(amount: i64) -> PriceShape {
        PriceShape {
            unit_amount: amount,
            currency: "usd".to_string(),
            recurring: Some(RecurringParams { interval: Interval::Month, interval_count: 1 }),
            product_data: ProductData { name: "Plan".to_string() },
        }
    }

    #[tokio::test]
    async fn test_identical_shape_reuses_price() {
        let client = MockStripeClient::new();
        let prices = PriceCache::new(InMemoryCache::new(100), client.clone());

        let first = prices.get_or_create_price("price_data_quote_1", &shape(1000)).await.unwrap();
        let second = prices.get_or_create_price("price_data_quote_1", &shape(1000)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.call_count("create_price"), 1);
        assert_eq!(client.call_count("retrieve_price"), 0);
    }

    #[tokio::test]
    async fn test_changed_field_creates_new_price() {
        let client = MockStripeClient::new();
        let prices = PriceCache::new(InMemoryCache::new(100), client.clone());

        let first = prices.get_or_create_price("k", &shape(1000)).await.unwrap();
        let second = prices.get_or_create_price("k", &shape(1200)).await.unwrap();
        assert_ne!(first, second);

        let mut renamed = shape(1200);
        renamed.product_data.name = "Plan 2".to_string();
        let third = prices.get_or_create_price("k", &renamed).await.unwrap();
        assert_ne!(second, third);

        // the entry now holds the latest shape
        let again = prices.get_or_create_price("k", &renamed).await.unwrap();
        assert_eq!(third, again);
        assert_eq!(client.call_count("create_price"), 3);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let cache = InMemoryCache::new(100);
        cache.set_bytes("k", b"not json".to_vec(), None).await.unwrap();
        let client = MockStripeClient::new();
        let prices = PriceCache::new(cache, client.clone());

        prices.get_or_create_price("k", &shape(1000)).await.unwrap();
        assert_eq!(client.call_count("create_price"), 1);
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let client = MockStripeClient::new();
        client.fail_on("create_price");
        let prices = PriceCache::new(InMemoryCache::new(100), client);

        assert!(prices.get_or_create_price("k", &shape(1000)).await.is_err());
    }

    #[test]
    fn test_keys() {
        assert_eq!(recurring_key("12"), "price_data_quote_12");
        assert_eq!(one_time_key("12"), "price_data_quote_once_12");
    }
}
