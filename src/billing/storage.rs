//! Local subscription records and webhook idempotency.
//!
//! Implement [`SubscriptionStore`] against the storefront database. Webhooks
//! always re-derive these records from Stripe, so a write that fails after a
//! successful remote call heals on the next delivery.

use super::cart::Order;
use super::remote::{SubscriptionObject, SubscriptionStatus};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Storage for local subscription entries and processed webhook keys.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Get the entry of a Stripe subscription.
    async fn get_entry(&self, subscription_id: &str) -> Result<Option<LocalSubscriptionEntry>>;

    /// Insert or replace an entry.
    async fn save_entry(&self, entry: &LocalSubscriptionEntry) -> Result<()>;

    /// Delete an entry. Deleting a missing entry is not an error.
    async fn delete_entry(&self, subscription_id: &str) -> Result<()>;

    /// Find the entry created for an order.
    async fn find_by_order(
        &self,
        order_increment_id: &str,
    ) -> Result<Option<LocalSubscriptionEntry>>;

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Record that a side effect keyed on `key` happened.
    ///
    /// Returns `false` when the key was already recorded. Implementations
    /// must make the check and the insert atomic (a unique index is enough).
    async fn claim(&self, key: &str) -> Result<bool>;

    /// Undo a claim whose side effect failed, so a redelivery can retry it.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Local record of a Stripe subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSubscriptionEntry {
    pub subscription_id: String,
    pub stripe_customer_id: String,
    pub payment_method_id: Option<String>,
    pub currency: String,
    pub status: SubscriptionStatus,
    /// Order that started the subscription; unknown while it is being created
    pub order_increment_id: Option<String>,
    pub customer_id: Option<String>,
    pub grand_total: f64,
    /// Cart to reorder from when the subscription was updated in place
    pub reorder_from_quote_id: Option<String>,
    pub created_at: i64,
}

impl LocalSubscriptionEntry {
    /// Build an entry from a remote subscription and, when known, its order.
    #[must_use]
    pub fn init_from(subscription: &SubscriptionObject, order: Option<&Order>, now: i64) -> Self {
        let currency = subscription
            .items
            .data
            .first()
            .map(|item| item.price.currency.clone())
            .or_else(|| order.map(|o| o.currency.to_ascii_lowercase()))
            .unwrap_or_else(|| "usd".to_string());

        Self {
            subscription_id: subscription.id.clone(),
            stripe_customer_id: subscription.customer.clone(),
            payment_method_id: subscription.default_payment_method.clone(),
            currency,
            status: subscription.status,
            order_increment_id: order.map(|o| o.increment_id.clone()),
            customer_id: order.and_then(|o| o.customer_id.clone()),
            grand_total: order.map(|o| o.grand_total).unwrap_or(0.0),
            reorder_from_quote_id: None,
            created_at: now,
        }
    }

    /// Refresh from the remote record, keeping local-only fields.
    pub fn refresh(&mut self, subscription: &SubscriptionObject, order: Option<&Order>) {
        let fresh = Self::init_from(subscription, order, self.created_at);
        self.stripe_customer_id = fresh.stripe_customer_id;
        self.payment_method_id = fresh.payment_method_id;
        self.currency = fresh.currency;
        self.status = fresh.status;
        if let Some(order) = order {
            self.link_order(order);
        }
    }

    /// Point the entry at `order` without touching the remote-derived fields.
    pub fn link_order(&mut self, order: &Order) {
        self.order_increment_id = Some(order.increment_id.clone());
        self.customer_id = order.customer_id.clone();
        self.grand_total = order.grand_total;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// In-memory implementations for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// In-memory subscription store.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        entries: RwLock<HashMap<String, LocalSubscriptionEntry>>,
        processed_events: RwLock<HashSet<String>>,
        claims: RwLock<HashSet<String>>,
        fail_saves: RwLock<bool>,
    }

    impl InMemorySubscriptionStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn entries(&self) -> Vec<LocalSubscriptionEntry> {
            self.inner.entries.read().unwrap().values().cloned().collect()
        }

        pub fn processed_events(&self) -> Vec<String> {
            self.inner.processed_events.read().unwrap().iter().cloned().collect()
        }

        pub fn claims(&self) -> Vec<String> {
            self.inner.claims.read().unwrap().iter().cloned().collect()
        }

        /// Make `save_entry` fail, as a database outage would.
        pub fn fail_saves(&self, fail: bool) {
            *self.inner.fail_saves.write().unwrap() = fail;
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn get_entry(&self, subscription_id: &str) -> Result<Option<LocalSubscriptionEntry>> {
            Ok(self.inner.entries.read().unwrap().get(subscription_id).cloned())
        }

        async fn save_entry(&self, entry: &LocalSubscriptionEntry) -> Result<()> {
            if *self.inner.fail_saves.read().unwrap() {
                return Err(crate::error::SubsyncError::service_unavailable("store offline"));
            }
            self.inner
                .entries
                .write()
                .unwrap()
                .insert(entry.subscription_id.clone(), entry.clone());
            Ok(())
        }

        async fn delete_entry(&self, subscription_id: &str) -> Result<()> {
            self.inner.entries.write().unwrap().remove(subscription_id);
            Ok(())
        }

        async fn find_by_order(
            &self,
            order_increment_id: &str,
        ) -> Result<Option<LocalSubscriptionEntry>> {
            Ok(self
                .inner
                .entries
                .read()
                .unwrap()
                .values()
                .find(|e| e.order_increment_id.as_deref() == Some(order_increment_id))
                .cloned())
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self.inner.processed_events.read().unwrap().contains(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner.processed_events.write().unwrap().insert(event_id.to_string());
            Ok(())
        }

        async fn claim(&self, key: &str) -> Result<bool> {
            Ok(self.inner.claims.write().unwrap().insert(key.to_string()))
        }

        async fn release(&self, key: &str) -> Result<()> {
            self.inner.claims.write().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemorySubscriptionStore;
    use super::*;
    use crate::billing::remote::List;
    use std::collections::HashMap;

    fn subscription() -> SubscriptionObject {
        SubscriptionObject {
            id: "sub_1".to_string(),
            customer: "cus_1".to_string(),
            status: SubscriptionStatus::Active,
            current_period_start: 0,
            current_period_end: 0,
            trial_end: None,
            cancel_at_period_end: false,
            default_payment_method: Some("pm_1".to_string()),
            latest_invoice: None,
            items: List::default(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_init_without_order() {
        let entry = LocalSubscriptionEntry::init_from(&subscription(), None, 10);
        assert_eq!(entry.currency, "usd");
        assert_eq!(entry.order_increment_id, None);
        assert_eq!(entry.grand_total, 0.0);
        assert_eq!(entry.payment_method_id.as_deref(), Some("pm_1"));
        assert!(entry.is_active());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemorySubscriptionStore::new();
        assert!(store.claim("invoice:in_1").await.unwrap());
        assert!(!store.claim("invoice:in_1").await.unwrap());

        store.release("invoice:in_1").await.unwrap();
        assert!(store.claim("invoice:in_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_entry_lookup_by_order() {
        let store = InMemorySubscriptionStore::new();
        let mut entry = LocalSubscriptionEntry::init_from(&subscription(), None, 10);
        entry.order_increment_id = Some("000000100".to_string());
        store.save_entry(&entry).await.unwrap();

        let found = store.find_by_order("000000100").await.unwrap().unwrap();
        assert_eq!(found.subscription_id, "sub_1");
        assert!(store.find_by_order("000000101").await.unwrap().is_none());

        store.delete_entry("sub_1").await.unwrap();
        assert!(store.get_entry("sub_1").await.unwrap().is_none());
    }
}
