//! Keeps the Stripe subscription of a cart in step with the cart.
//!
//! Checkout may call [`SubscriptionReconciler::reconcile`] many times for the
//! same cart while the customer edits it. Only metadata and trial end can be
//! changed on an existing subscription; any other drift between the remote
//! object and the cart cancels the stale subscription and creates a new one.

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::cart::{Cart, Order, PricingSource};
use super::client::FullStripeClient;
use super::combined::{aggregate, renew_together};
use super::coupon::CouponResolver;
use super::error::BillingError;
use super::price_cache::{PriceCache, one_time_key, recurring_key};
use super::profile::{ProfileBuilder, SubscriptionProfile, stripe_discount_adjustment};
use super::remote::{
    InvoiceItemParams, META_ORDER_NUMBER, META_SUBSCRIPTION_PRODUCT_IDS, META_TYPE,
    PaymentSettings, PriceShape, ProductData, RecurringParams, SUBSCRIPTIONS_TOTAL_TYPE,
    SubscriptionItemParams, SubscriptionObject, SubscriptionParams, UpdateSubscriptionParams,
};
use super::storage::{LocalSubscriptionEntry, SubscriptionStore};
use crate::config::{SubscriptionSettings, SubsyncConfig};
use crate::error::Result;
use crate::traits::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Paths expanded on every subscription the engine creates or retrieves.
pub const SUBSCRIPTION_EXPAND: [&str; 2] =
    ["latest_invoice.payment_intent", "pending_setup_intent"];

/// Amount charged today on top of the recurring price, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPayment {
    pub amount_minor: i64,
    pub currency: String,
}

impl InitialPayment {
    #[must_use]
    pub fn none(currency: impl Into<String>) -> Self {
        Self {
            amount_minor: 0,
            currency: currency.into(),
        }
    }
}

/// Creates, updates and recreates cart subscriptions.
pub struct SubscriptionReconciler<C, K> {
    client: C,
    prices: PriceCache<Arc<K>, C>,
    coupons: CouponResolver<C, Arc<K>>,
    profiles: ProfileBuilder,
    settings: SubscriptionSettings,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<C, K> SubscriptionReconciler<C, K>
where
    C: FullStripeClient + Clone,
    K: Cache,
{
    pub fn new(client: C, cache: K, config: &SubsyncConfig) -> Self {
        let cache = Arc::new(cache);
        Self {
            prices: PriceCache::new(cache.clone(), client.clone())
                .with_ttl(config.cache.price_ttl()),
            coupons: CouponResolver::new(client.clone(), cache).with_ttl(config.cache.price_ttl()),
            client,
            profiles: ProfileBuilder::new(config.tax),
            settings: config.subscriptions,
            audit: Arc::new(TracingAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn profile_builder(&self) -> &ProfileBuilder {
        &self.profiles
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    pub(crate) fn audit(&self) -> &Arc<dyn BillingAuditLogger> {
        &self.audit
    }

    /// Subscription profiles of the cart, empty when subscriptions are off.
    pub fn cart_profiles(&self, cart: &Cart) -> Result<Vec<SubscriptionProfile>> {
        if !self.settings.enabled {
            return Ok(Vec::new());
        }
        Ok(self.profiles.profiles(PricingSource::Cart(cart))?)
    }

    /// The single subscription item billing every subscription line of the
    /// cart, backed by a memoized recurring price.
    pub async fn subscription_item(
        &self,
        cart: &Cart,
        profiles: &[SubscriptionProfile],
        order: Option<&Order>,
        now: i64,
    ) -> Result<SubscriptionItemParams> {
        if !renew_together(profiles, now) {
            return Err(BillingError::MustBuySeparately.into());
        }

        let combined = aggregate(profiles, self.profiles.tax_settings())?;
        let shape = PriceShape {
            unit_amount: combined.amount_minor,
            currency: combined.currency.clone(),
            recurring: Some(RecurringParams {
                interval: combined.interval,
                interval_count: combined.interval_count,
            }),
            product_data: ProductData { name: combined.name.clone() },
        };
        let price = self.prices.get_or_create_price(&recurring_key(&cart.id), &shape).await?;

        Ok(SubscriptionItemParams {
            id: None,
            metadata: subscription_metadata(cart, &combined.product_ids, order),
            price,
            quantity: 1,
        })
    }

    /// Parameters of the subscription the cart needs, or `None` when the
    /// cart has no subscription lines.
    pub async fn build_subscription_params(
        &self,
        cart: &Cart,
        order: Option<&Order>,
        initial: &InitialPayment,
        now: i64,
    ) -> Result<Option<SubscriptionParams>> {
        let profiles = self.cart_profiles(cart)?;
        if profiles.is_empty() {
            return Ok(None);
        }

        let item = self.subscription_item(cart, &profiles, order, now).await?;

        let customer = cart
            .stripe_customer_id
            .clone()
            .ok_or_else(|| BillingError::MissingCustomer { cart_id: cart.id.clone() })?;

        let coupon = self.coupons.resolve(&profiles).await;

        let mut add_invoice_items = Vec::new();
        if initial.amount_minor > 0 {
            let shape = PriceShape {
                unit_amount: initial.amount_minor + stripe_discount_adjustment(&profiles),
                currency: initial.currency.to_ascii_lowercase(),
                recurring: None,
                product_data: ProductData { name: "One time payment".to_string() },
            };
            let price = self.prices.get_or_create_price(&one_time_key(&cart.id), &shape).await?;
            add_invoice_items.push(InvoiceItemParams { price, quantity: 1 });
        }

        Ok(Some(SubscriptionParams {
            customer,
            metadata: item.metadata.clone(),
            items: vec![item],
            payment_behavior: "default_incomplete".to_string(),
            expand: SUBSCRIPTION_EXPAND.iter().map(|s| s.to_string()).collect(),
            payment_settings: PaymentSettings {
                save_default_payment_method: "on_subscription".to_string(),
            },
            coupon,
            add_invoice_items,
            trial_end: trial_end(&profiles, now),
        }))
    }

    /// Bring the cart's subscription up to date.
    ///
    /// Returns `None` when the cart has no subscription lines.
    pub async fn reconcile(
        &self,
        cart: &Cart,
        existing_id: Option<&str>,
        initial: &InitialPayment,
        now: i64,
    ) -> Result<Option<SubscriptionObject>> {
        let Some(params) = self.build_subscription_params(cart, None, initial, now).await? else {
            return Ok(None);
        };

        let Some(existing_id) = existing_id else {
            return self.create(cart, &params).await.map(Some);
        };

        let remote = match self
            .client
            .retrieve_subscription(existing_id, &SUBSCRIPTION_EXPAND)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!(
                    target: "subsync::reconciler",
                    subscription_id = %existing_id,
                    error = %e,
                    "Could not retrieve subscription"
                );
                return self.create(cart, &params).await.map(Some);
            }
        };

        if let Err(invalidation) = check_invalidation(&remote, &params) {
            tracing::warn!(
                target: "subsync::reconciler",
                subscription_id = %existing_id,
                cart_id = %cart.id,
                "Will re-create subscription: {}", invalidation
            );

            if let Err(e) = self.client.cancel_subscription(existing_id).await {
                tracing::warn!(
                    target: "subsync::reconciler",
                    subscription_id = %existing_id,
                    error = %e,
                    "Failed to cancel stale subscription"
                );
            }

            let created = self.client.create_subscription(&params).await?;
            self.audit
                .log(BillingAuditEvent::SubscriptionRecreated {
                    cart_id: cart.id.clone(),
                    old_subscription_id: existing_id.to_string(),
                    new_subscription_id: created.id.clone(),
                    reason: invalidation.to_string(),
                })
                .await;
            return Ok(Some(created));
        }

        self.apply_updatable(&cart.id, remote, &params).await.map(Some)
    }

    /// Bring the subscription of a placed order up to date and record it
    /// locally.
    ///
    /// Unlike [`reconcile`](Self::reconcile), drift is reported to the
    /// customer instead of silently recreating the subscription: the order
    /// was placed against the old one.
    pub async fn reconcile_order<S>(
        &self,
        order: &Order,
        cart: &Cart,
        existing_id: Option<&str>,
        initial: &InitialPayment,
        store: &S,
        now: i64,
    ) -> Result<Option<SubscriptionObject>>
    where
        S: SubscriptionStore + ?Sized,
    {
        let Some(params) = self
            .build_subscription_params(cart, Some(order), initial, now)
            .await?
        else {
            return Ok(None);
        };

        let subscription = match existing_id {
            None => self.create(cart, &params).await?,
            Some(existing_id) => {
                let remote = self
                    .client
                    .retrieve_subscription(existing_id, &SUBSCRIPTION_EXPAND)
                    .await?;

                if !order.payment.is_migrated_subscription {
                    if let Err(invalidation) = check_invalidation(&remote, &params) {
                        tracing::error!(
                            target: "subsync::reconciler",
                            subscription_id = %existing_id,
                            order = %order.increment_id,
                            "{}", invalidation
                        );
                        return Err(BillingError::CartChanged.into());
                    }
                }

                self.apply_updatable(&cart.id, remote, &params).await?
            }
        };

        save_entry(store, &subscription, order, now).await;
        Ok(Some(subscription))
    }

    async fn create(&self, cart: &Cart, params: &SubscriptionParams) -> Result<SubscriptionObject> {
        let created = self.client.create_subscription(params).await?;
        tracing::info!(
            target: "subsync::reconciler",
            subscription_id = %created.id,
            cart_id = %cart.id,
            "Created subscription"
        );
        self.audit
            .log(BillingAuditEvent::SubscriptionCreated {
                cart_id: cart.id.clone(),
                subscription_id: created.id.clone(),
                customer_id: created.customer.clone(),
            })
            .await;
        Ok(created)
    }

    async fn apply_updatable(
        &self,
        cart_id: &str,
        remote: SubscriptionObject,
        params: &SubscriptionParams,
    ) -> Result<SubscriptionObject> {
        let update = updatable_params(params);
        if !needs_update(&remote, &update) {
            return Ok(remote);
        }

        let updated = self.client.update_subscription(&remote.id, &update).await?;
        self.audit
            .log(BillingAuditEvent::SubscriptionUpdated {
                cart_id: cart_id.to_string(),
                subscription_id: updated.id.clone(),
            })
            .await;
        Ok(updated)
    }
}

/// Upsert the local entry, logging rather than failing: the remote
/// subscription already exists and the next webhook rebuilds the entry.
pub(crate) async fn save_entry<S>(
    store: &S,
    subscription: &SubscriptionObject,
    order: &Order,
    now: i64,
)
where
    S: SubscriptionStore + ?Sized,
{
    let entry = match store.get_entry(&subscription.id).await {
        Ok(Some(mut entry)) => {
            entry.refresh(subscription, Some(order));
            entry
        }
        _ => LocalSubscriptionEntry::init_from(subscription, Some(order), now),
    };

    if let Err(e) = store.save_entry(&entry).await {
        tracing::error!(
            target: "subsync::reconciler",
            subscription_id = %subscription.id,
            order = %order.increment_id,
            error = %e,
            "Subscription saved in Stripe but not locally"
        );
    }
}

fn subscription_metadata(
    cart: &Cart,
    product_ids: &[String],
    order: Option<&Order>,
) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(META_TYPE.to_string(), SUBSCRIPTIONS_TOTAL_TYPE.to_string());
    metadata.insert(META_SUBSCRIPTION_PRODUCT_IDS.to_string(), product_ids.join(","));

    let order_number = order
        .map(|o| o.increment_id.clone())
        .filter(|id| !id.is_empty())
        .or_else(|| cart.reserved_order_id.clone());
    if let Some(order_number) = order_number {
        metadata.insert(META_ORDER_NUMBER.to_string(), order_number);
    }
    metadata
}

/// Trial end of the subscription: the first product trial, overridden by a
/// migrated trial end.
fn trial_end(profiles: &[SubscriptionProfile], now: i64) -> Option<i64> {
    let mut trial_end = profiles
        .iter()
        .find(|p| p.trial.trial_days() > 0)
        .map(|p| p.trial.billing_start(now));

    for profile in profiles {
        if let Some(ts) = profile.trial.trial_end() {
            trial_end = Some(ts);
        }
    }
    trial_end
}

/// Verify that nothing except updatable fields differs between the remote
/// subscription and the parameters the cart implies.
pub fn check_invalidation(
    remote: &SubscriptionObject,
    params: &SubscriptionParams,
) -> std::result::Result<(), BillingError> {
    let invalid = |reason: &str| BillingError::CacheInvalidation { reason: reason.to_string() };

    if remote.customer != params.customer {
        return Err(invalid("The customer has changed."));
    }

    let remote_items = &remote.items.data;
    if remote_items.len() != params.items.len() {
        return Err(invalid("The subscription items have changed."));
    }
    for (remote_item, item) in remote_items.iter().zip(&params.items) {
        let same_meta = [META_TYPE, META_SUBSCRIPTION_PRODUCT_IDS]
            .iter()
            .all(|key| remote_item.metadata.get(*key) == item.metadata.get(*key));
        if remote_item.price.id != item.price
            || remote_item.quantity != item.quantity
            || !same_meta
        {
            return Err(invalid("The subscription items have changed."));
        }
    }

    let lines = remote
        .latest_invoice()
        .map(|invoice| invoice.lines.data.as_slice())
        .unwrap_or_default();

    if let Some(expected) = params.add_invoice_items.last() {
        if lines.is_empty() {
            return Err(invalid("Regular items were added to the cart."));
        }
        let mut has_regular_items = false;
        for line in lines.iter().filter(|l| !l.is_recurring()) {
            has_regular_items = true;
            let same_price = line.price.as_ref().is_some_and(|p| p.id == expected.price);
            if !same_price || line.quantity.unwrap_or(1) != expected.quantity {
                return Err(invalid("One time payment amount has changed."));
            }
        }
        if !has_regular_items {
            return Err(invalid("Regular items were added to the cart."));
        }
    } else if lines.iter().any(|l| !l.is_recurring()) {
        return Err(invalid("Regular items were removed from the cart."));
    }

    let remote_coupon = remote.latest_invoice().and_then(|i| i.coupon_id());
    if remote_coupon != params.coupon.as_deref() {
        return Err(invalid("The discount coupon has changed."));
    }

    Ok(())
}

/// The subset of creation parameters an existing subscription accepts.
#[must_use]
pub fn updatable_params(params: &SubscriptionParams) -> UpdateSubscriptionParams {
    UpdateSubscriptionParams {
        metadata: Some(params.metadata.clone()),
        trial_end: params.trial_end,
        expand: params.expand.clone(),
        ..Default::default()
    }
}

/// Whether sending `update` would change the remote subscription.
#[must_use]
pub fn needs_update(remote: &SubscriptionObject, update: &UpdateSubscriptionParams) -> bool {
    let metadata_differs = update.metadata.as_ref().is_some_and(|metadata| {
        metadata
            .iter()
            .any(|(key, value)| remote.metadata.get(key) != Some(value))
    });
    let trial_differs = update.trial_end.is_some() && update.trial_end != remote.trial_end;

    metadata_differs || trial_differs
}
