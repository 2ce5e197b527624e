//! Customer-initiated subscription updates.
//!
//! The storefront starts an update by storing an [`UpdateIntent`] for the
//! checkout session and filling a cart with the new products. On submit,
//! [`SubscriptionUpdater::perform_update`] either places a new order (a
//! prorated upgrade collects a payment now) or patches the subscription in
//! place and lets the next renewal create the order.

use super::audit::BillingAuditEvent;
use super::canonical::{Interval, format_amount, to_major_units};
use super::cart::{Cart, Order};
use super::client::FullStripeClient;
use super::combined::{CombinedProfile, aggregate};
use super::error::BillingError;
use super::orders::{CheckoutDetails, OrderGateway};
use super::proration::{CurrentSubscription, ProrationDecision, ProrationEngine};
use super::reconciler::{SUBSCRIPTION_EXPAND, SubscriptionReconciler, save_entry};
use super::remote::{
    Expandable, InvoiceObject, META_ORDER_NUMBER, META_ORIGINAL_ORDER_NUMBER, ProrationBehavior,
    SubscriptionObject, UpcomingInvoiceParams, UpdateSubscriptionParams,
};
use super::storage::{LocalSubscriptionEntry, SubscriptionStore};
use crate::error::{Result, SubsyncError};
use crate::traits::{Cache, CacheExt};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Pending update of one subscription, scoped to a checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIntent {
    pub subscription_id: String,
    pub original_order_increment_id: String,
    pub product_ids: Vec<String>,
    pub current_period_start: i64,
    pub current_period_end: i64,
    /// Fixed on the first preview so that the charge shown is the charge made
    #[serde(default)]
    pub proration_timestamp: Option<i64>,
    /// Invoice preview lines, added to the new order's history
    #[serde(default)]
    pub comments: Option<String>,
}

impl UpdateIntent {
    /// Intent to update `current`.
    #[must_use]
    pub fn for_subscription(current: &CurrentSubscription) -> Self {
        let subscription = current.subscription();
        Self {
            subscription_id: subscription.id.clone(),
            original_order_increment_id: current
                .order_increment_id()
                .unwrap_or_default()
                .to_string(),
            product_ids: current.product_ids(),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            proration_timestamp: None,
            comments: None,
        }
    }
}

/// Session-scoped storage of pending updates.
#[async_trait]
pub trait UpdateIntentStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<UpdateIntent>>;

    async fn save(&self, session_id: &str, intent: &UpdateIntent) -> Result<()>;

    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// [`UpdateIntentStore`] on top of a [`Cache`]; abandoned intents expire.
pub struct CachedUpdateIntentStore<K> {
    cache: K,
    ttl: Duration,
}

impl<K: Cache> CachedUpdateIntentStore<K> {
    pub fn new(cache: K, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(session_id: &str) -> String {
        format!("subscription_update_{}", session_id)
    }
}

#[async_trait]
impl<K: Cache> UpdateIntentStore for CachedUpdateIntentStore<K> {
    async fn load(&self, session_id: &str) -> Result<Option<UpdateIntent>> {
        self.cache.get(&Self::key(session_id)).await
    }

    async fn save(&self, session_id: &str, intent: &UpdateIntent) -> Result<()> {
        self.cache.set(&Self::key(session_id), intent, Some(self.ttl)).await
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.cache.delete(&Self::key(session_id)).await
    }
}

/// A submitted update checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub session_id: String,
    pub logged_in: bool,
    /// Cart holding the new products
    pub cart_id: Option<String>,
    pub details: CheckoutDetails,
}

/// Result of refunding a leftover credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundOutcome {
    NotRequired,
    Refunded { refund_id: String, amount: i64 },
    Failed { reason: String },
}

/// How an update was carried out.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    NewOrderPlaced {
        order: Order,
        subscription: SubscriptionObject,
    },
    PatchedInPlace {
        subscription: SubscriptionObject,
        refund: RefundOutcome,
    },
}

impl UpdateOutcome {
    pub fn subscription(&self) -> &SubscriptionObject {
        match self {
            Self::NewOrderPlaced { subscription, .. }
            | Self::PatchedInPlace { subscription, .. } => subscription,
        }
    }
}

/// One line of an update preview, in the cart currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewLine {
    pub amount: f64,
    pub currency: String,
    pub label: String,
}

/// What the customer will pay for an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePreview {
    /// Credit for the unused time of the current plan
    pub unused_time: Option<PreviewLine>,
    /// Charge for the remaining time on the new plan
    pub proration_fee: Option<PreviewLine>,
    pub new_price: Option<PreviewLine>,
    /// Added to the cart grand total so checkout shows the amount due now
    pub proration_adjustment: Option<f64>,
    pub base_proration_adjustment: Option<f64>,
}

/// Carries out subscription updates.
pub struct SubscriptionUpdater<C, K> {
    reconciler: Arc<SubscriptionReconciler<C, K>>,
    engine: ProrationEngine,
    gateway: Arc<dyn OrderGateway>,
    store: Arc<dyn SubscriptionStore>,
    intents: Arc<dyn UpdateIntentStore>,
}

impl<C, K> SubscriptionUpdater<C, K>
where
    C: FullStripeClient + Clone,
    K: Cache,
{
    pub fn new(
        reconciler: Arc<SubscriptionReconciler<C, K>>,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn SubscriptionStore>,
        intents: Arc<dyn UpdateIntentStore>,
    ) -> Self {
        Self {
            engine: ProrationEngine::new(*reconciler.settings()),
            reconciler,
            gateway,
            store,
            intents,
        }
    }

    fn client(&self) -> &C {
        self.reconciler.client()
    }

    async fn current_subscription(&self, subscription_id: &str) -> Result<CurrentSubscription> {
        let subscription = self
            .client()
            .retrieve_subscription(subscription_id, &SUBSCRIPTION_EXPAND)
            .await?;
        Ok(CurrentSubscription::load(subscription, self.gateway.as_ref()).await)
    }

    fn combined_profile(&self, cart: &Cart) -> Result<CombinedProfile> {
        let profiles = self.reconciler.cart_profiles(cart)?;
        Ok(aggregate(&profiles, self.reconciler.profile_builder().tax_settings())?)
    }

    /// Weigh the switch and, for a prorated downgrade, make sure no credit
    /// balance is already on the customer so the refund can be accounted for.
    pub async fn should_place_new_order(
        &self,
        current: &CurrentSubscription,
        cart: &Cart,
    ) -> Result<ProrationDecision> {
        let combined = self.combined_profile(cart)?;
        let decision = self.engine.decide(current, cart, &combined)?;

        if decision.refund_credit_balance {
            let customer = self
                .client()
                .retrieve_customer(&current.subscription().customer)
                .await?;
            if customer.balance != 0 {
                return Err(BillingError::CreditBalance { balance: customer.balance }.into());
            }
        }

        Ok(decision)
    }

    /// Apply a submitted update checkout.
    pub async fn perform_update(&self, request: &UpdateRequest, now: i64) -> Result<UpdateOutcome> {
        if !request.logged_in {
            return Err(BillingError::NotLoggedIn.into());
        }
        let cart_id = request.cart_id.as_deref().ok_or(BillingError::MissingQuote)?;
        if self.gateway.load_cart(cart_id).await?.is_none() {
            return Err(BillingError::MissingQuote.into());
        }
        let intent = self
            .intents
            .load(&request.session_id)
            .await?
            .ok_or(BillingError::MissingUpdateIntent)?;

        let current = self.current_subscription(&intent.subscription_id).await?;
        check_items(current.subscription())?;

        let cart = self.gateway.apply_checkout_details(cart_id, &request.details).await?;
        let decision = self.should_place_new_order(&current, &cart).await?;

        let outcome = if decision.place_new_order {
            let order = self.gateway.submit_cart(cart_id).await?;
            let subscription = self
                .patch(&current, &cart, &decision, &intent, Some(&order), now)
                .await?;

            log_local_failure(
                &subscription.id,
                "set_processing",
                self.gateway
                    .set_processing(&order.increment_id, "The subscription has been updated successfully.")
                    .await,
            );
            if let Some(comments) = &intent.comments {
                log_local_failure(
                    &subscription.id,
                    "add_order_comment",
                    self.gateway.add_order_comment(&order.increment_id, comments).await,
                );
            }
            save_entry(self.store.as_ref(), &subscription, &order, now).await;

            UpdateOutcome::NewOrderPlaced { order, subscription }
        } else {
            let latest_invoice_id = current.subscription().latest_invoice_id().map(str::to_string);
            let subscription = self.patch(&current, &cart, &decision, &intent, None, now).await?;

            self.record_in_place_update(&subscription, &cart, now).await;
            log_local_failure(
                &subscription.id,
                "deactivate_cart",
                self.gateway.deactivate_cart(&cart.id).await,
            );
            self.comment_original_order(&intent, &subscription, &cart).await;

            let original_order =
                Some(intent.original_order_increment_id.as_str()).filter(|id| !id.is_empty());
            let refund = if decision.refund_credit_balance {
                self.refund_credit_balance(latest_invoice_id.as_deref(), original_order).await
            } else {
                RefundOutcome::NotRequired
            };

            UpdateOutcome::PatchedInPlace { subscription, refund }
        };

        // Stripe already changed, so the outcome stands
        if let Err(e) = self.intents.clear(&request.session_id).await {
            tracing::warn!(
                target: "subsync::updates",
                session_id = %request.session_id,
                error = %e,
                "Could not clear update intent"
            );
        }
        Ok(outcome)
    }

    async fn patch(
        &self,
        current: &CurrentSubscription,
        cart: &Cart,
        decision: &ProrationDecision,
        intent: &UpdateIntent,
        order: Option<&Order>,
        now: i64,
    ) -> Result<SubscriptionObject> {
        let remote = current.subscription();
        let original_order = current.order_increment_id().unwrap_or_default().to_string();

        let profiles = self.reconciler.cart_profiles(cart)?;
        let combined = aggregate(&profiles, self.reconciler.profile_builder().tax_settings())?;
        let mut item = self.reconciler.subscription_item(cart, &profiles, order, now).await?;
        item.id = remote.items.data.first().map(|i| i.id.clone());

        let mut metadata = item.metadata.clone();
        let description = match order {
            Some(order) => format!("Order #{}", order.increment_id),
            None => {
                metadata.insert(META_ORIGINAL_ORDER_NUMBER.to_string(), original_order.clone());
                metadata.insert(META_ORDER_NUMBER.to_string(), String::new());
                format!(
                    "Updated subscription of original order #{}. Pending payment and new order on {}.",
                    original_order,
                    format_billing_date(remote.current_period_end)
                )
            }
        };

        let mut params = UpdateSubscriptionParams {
            metadata: Some(metadata),
            cancel_at_period_end: Some(false),
            items: Some(vec![item]),
            description: Some(description),
            expand: SUBSCRIPTION_EXPAND.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };

        if decision.use_prorations {
            params.proration_behavior = Some(ProrationBehavior::AlwaysInvoice);
            params.proration_date = Some(intent.proration_timestamp.unwrap_or(now));
        } else {
            params.proration_behavior = Some(ProrationBehavior::None);
            if current.cadence() != Some((combined.interval, combined.interval_count)) {
                params.trial_end = Some(remote.current_period_end);
            }
        }

        let updated = self
            .client()
            .update_subscription(&remote.id, &params)
            .await
            .map_err(|e| match e {
                SubsyncError::Billing(BillingError::StripeApiError {
                    message,
                    http_status: Some(400),
                    ..
                }) => SubsyncError::bad_request(message),
                other => other,
            })?;

        tracing::info!(
            target: "subsync::updates",
            subscription_id = %updated.id,
            prorated = decision.use_prorations,
            delta = decision.price_change.delta,
            "Subscription updated upon customer request"
        );
        self.reconciler
            .audit()
            .log(BillingAuditEvent::SubscriptionPatched {
                subscription_id: updated.id.clone(),
                original_order,
                prorated: decision.use_prorations,
                new_order: order.map(|o| o.increment_id.clone()),
            })
            .await;

        Ok(updated)
    }

    async fn record_in_place_update(
        &self,
        subscription: &SubscriptionObject,
        cart: &Cart,
        now: i64,
    ) {
        let mut entry = match self.store.get_entry(&subscription.id).await {
            Ok(Some(mut entry)) => {
                entry.refresh(subscription, None);
                entry
            }
            _ => LocalSubscriptionEntry::init_from(subscription, None, now),
        };
        entry.reorder_from_quote_id = Some(cart.id.clone());

        if let Err(e) = self.store.save_entry(&entry).await {
            tracing::error!(
                target: "subsync::updates",
                subscription_id = %subscription.id,
                error = %e,
                "Subscription updated in Stripe but not locally"
            );
        }
    }

    async fn comment_original_order(
        &self,
        intent: &UpdateIntent,
        subscription: &SubscriptionObject,
        cart: &Cart,
    ) {
        if intent.original_order_increment_id.is_empty() {
            tracing::error!(
                target: "subsync::updates",
                "Could not add subscription update order comments: The subscription update data did not reference an original order increment ID."
            );
            return;
        }

        let comment = format!(
            "Successfully updated subscription upon customer request. A payment of {} will be collected on {}. A new order will be created from cart ID {} upon payment collection.",
            subscription_amount(subscription),
            format_billing_date(intent.current_period_end),
            cart.id
        );
        if let Err(e) = self
            .gateway
            .add_order_comment(&intent.original_order_increment_id, &comment)
            .await
        {
            tracing::error!(
                target: "subsync::updates",
                order = %intent.original_order_increment_id,
                "Could not add subscription update order comments: {}", e
            );
        }
    }

    /// Refund the credit a downgrade left on the customer, against the
    /// payment of `invoice_id`. Failures are logged, never raised.
    pub async fn refund_credit_balance(
        &self,
        invoice_id: Option<&str>,
        order: Option<&str>,
    ) -> RefundOutcome {
        match self.try_refund_credit_balance(invoice_id, order).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    target: "subsync::updates",
                    invoice_id = ?invoice_id,
                    "Unable to refund customer credit balance: {}", e
                );
                RefundOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    async fn try_refund_credit_balance(
        &self,
        invoice_id: Option<&str>,
        order: Option<&str>,
    ) -> Result<RefundOutcome> {
        let invoice_id =
            invoice_id.ok_or_else(|| SubsyncError::internal("The subscription does not have an invoice to refund."))?;
        let invoice = self
            .client()
            .retrieve_invoice(invoice_id, &["payment_intent", "customer"])
            .await?;

        let customer = match &invoice.customer {
            Some(Expandable::Object(customer)) => (**customer).clone(),
            Some(Expandable::Id(id)) => self.client().retrieve_customer(id).await?,
            None => {
                return Err(SubsyncError::internal(
                    "The last invoice for this subscription is not associated with a customer.",
                ));
            }
        };

        if customer.balance >= 0 {
            return Ok(RefundOutcome::NotRequired);
        }

        let payment_intent = invoice
            .payment_intent
            .as_ref()
            .and_then(Expandable::as_object)
            .ok_or_else(|| {
                SubsyncError::internal("The last invoice for this subscription does not have a payment intent.")
            })?;

        let credit = -customer.balance;
        if credit > payment_intent.amount {
            return Err(SubsyncError::internal(
                "The customer credit balance is larger than the available amount to refund.",
            ));
        }

        if let Some(order) = order {
            let comment = format!(
                "The customer has an unused credit balance of {} from their previous subscription. We will refund the amount to the customer.",
                format_amount(credit, &invoice.currency)
            );
            self.gateway.add_order_comment(order, &comment).await?;
        }

        let refund = self.client().create_refund(&payment_intent.id, credit).await?;
        self.client().update_customer_balance(&customer.id, 0).await?;

        self.reconciler
            .audit()
            .log(BillingAuditEvent::CreditRefunded {
                customer_id: customer.id.clone(),
                payment_intent_id: payment_intent.id.clone(),
                amount: credit,
            })
            .await;

        Ok(RefundOutcome::Refunded { refund_id: refund.id, amount: credit })
    }

    /// Abandon the session's pending update and empty its cart.
    ///
    /// Returns the notice to show, or `None` when there was nothing to cancel.
    pub async fn cancel_subscription_update(
        &self,
        session_id: &str,
        cart_id: Option<&str>,
    ) -> Result<Option<String>> {
        if !self.reconciler.settings().enabled {
            return Ok(None);
        }
        if self.intents.load(session_id).await?.is_none() {
            return Ok(None);
        }

        let mut names = Vec::new();
        if let Some(cart_id) = cart_id {
            if let Some(cart) = self.gateway.load_cart(cart_id).await? {
                names.extend(cart.items.iter().map(|item| item.name.clone()));
            }
            self.gateway.clear_cart(cart_id).await?;
        }
        self.intents.clear(session_id).await?;

        let notice = if names.is_empty() {
            "The subscription update has been canceled.".to_string()
        } else {
            format!("The subscription update ({}) has been canceled.", names.join(", "))
        };
        Ok(Some(notice))
    }

    /// Preview the invoice the pending update would produce.
    ///
    /// The first preview fixes the proration timestamp on the intent and
    /// every preview stores its lines as the update comments.
    pub async fn preview_update(
        &self,
        session_id: &str,
        cart: &Cart,
        now: i64,
    ) -> Result<Option<UpdatePreview>> {
        let Some(mut intent) = self.intents.load(session_id).await? else {
            return Ok(None);
        };
        let proration_timestamp = *intent.proration_timestamp.get_or_insert(now);

        let current = self.current_subscription(&intent.subscription_id).await?;
        let remote = current.subscription();
        let remote_item = remote
            .items
            .data
            .first()
            .ok_or_else(|| SubsyncError::internal("This subscription has no price data."))?;

        let profiles = self.reconciler.cart_profiles(cart)?;
        let combined = aggregate(&profiles, self.reconciler.profile_builder().tax_settings())?;
        let decision = self.engine.decide(&current, cart, &combined)?;
        let mut item = self.reconciler.subscription_item(cart, &profiles, None, now).await?;
        item.id = Some(remote_item.id.clone());

        let params = UpcomingInvoiceParams {
            customer: remote.customer.clone(),
            subscription: remote.id.clone(),
            subscription_items: vec![item],
            subscription_proration_behavior: if decision.use_prorations {
                ProrationBehavior::AlwaysInvoice
            } else {
                ProrationBehavior::None
            },
            subscription_proration_date: decision.use_prorations.then_some(proration_timestamp),
        };
        let invoice = self.client().upcoming_invoice(&params).await?;

        let (preview, comments) = summarize_preview(&invoice, cart);
        intent.comments = comments;
        self.intents.save(session_id, &intent).await?;

        let empty = preview.unused_time.is_none()
            && preview.proration_fee.is_none()
            && preview.new_price.is_none()
            && preview.proration_adjustment.is_none();
        Ok((!empty).then_some(preview))
    }

    /// Cancel a subscription from the storefront and forget it locally.
    pub async fn cancel_local_subscription(&self, subscription_id: &str) -> Result<()> {
        self.client().cancel_subscription(subscription_id).await?;

        if let Some(entry) = self.store.get_entry(subscription_id).await? {
            if let Some(cart_id) = &entry.reorder_from_quote_id {
                log_local_failure(
                    subscription_id,
                    "release_recurring_cart",
                    self.gateway.release_recurring_cart(cart_id).await,
                );
            }
        }
        self.store.delete_entry(subscription_id).await?;

        self.reconciler
            .audit()
            .log(BillingAuditEvent::SubscriptionCanceled {
                subscription_id: subscription_id.to_string(),
            })
            .await;
        Ok(())
    }
}

/// Local bookkeeping after Stripe has already changed is logged, never raised.
fn log_local_failure(subscription_id: &str, step: &str, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(
            target: "subsync::updates",
            subscription_id,
            step,
            error = %e,
            "Subscription changed in Stripe but a local step failed"
        );
    }
}

fn check_items(subscription: &SubscriptionObject) -> std::result::Result<(), BillingError> {
    match subscription.items.data.len() {
        0 => Err(BillingError::UnsupportedItems {
            message: "There are no subscription items to update".to_string(),
        }),
        1 => Ok(()),
        _ => Err(BillingError::UnsupportedItems {
            message: "Updating a subscription with multiple subscription items is not implemented.".to_string(),
        }),
    }
}

fn subscription_amount(subscription: &SubscriptionObject) -> String {
    subscription
        .items
        .data
        .first()
        .map(|item| {
            let amount = item.price.unit_amount.unwrap_or(0) * item.quantity as i64;
            format_amount(amount, &item.price.currency)
        })
        .unwrap_or_default()
}

fn summarize_preview(invoice: &InvoiceObject, cart: &Cart) -> (UpdatePreview, Option<String>) {
    let mut charges = Vec::new();
    let mut credits = Vec::new();
    let mut subscription_amount = 0;
    let mut unused_amount = 0;
    let mut remaining_amount = 0;
    let mut subscription_label = None;
    let mut currency = invoice.currency.clone();

    for line in &invoice.lines.data {
        currency = line.currency.clone();
        let description = lowercase_first(line.description.as_deref().unwrap_or_default());
        let comment = format!("{} {}", format_amount(line.amount, &line.currency), description);
        if line.amount < 0 {
            credits.push(comment);
        } else {
            charges.push(comment);
        }

        let cadence = line
            .price
            .as_ref()
            .and_then(|p| p.recurring.as_ref())
            .map(|r| (r.interval, r.interval_count));

        if line.line_type == "subscription" {
            subscription_amount += line.amount;
            if let Some((interval, count)) = cadence {
                subscription_label = Some(format_interval(
                    subscription_amount,
                    &line.currency,
                    count,
                    interval,
                ));
            }
        } else if line.amount < 0 {
            unused_amount += line.amount;
        } else if line.amount > 0 {
            remaining_amount += line.amount;
            if subscription_label.is_none() {
                if let Some((interval, count)) = cadence {
                    subscription_label =
                        Some(format_interval(remaining_amount, &line.currency, count, interval));
                }
            }
        }
    }

    let rate = if cart.base_to_quote_rate > 0.0 { cart.base_to_quote_rate } else { 1.0 };
    let preview_line = |amount: i64, label: String| PreviewLine {
        amount: to_major_units(amount, &currency),
        currency: currency.clone(),
        label,
    };

    let mut preview = UpdatePreview::default();
    if unused_amount < 0 {
        preview.unused_time =
            Some(preview_line(unused_amount, format_amount(unused_amount, &currency)));
    }
    if remaining_amount > 0 {
        preview.proration_fee =
            Some(preview_line(remaining_amount, format_amount(remaining_amount, &currency)));
    }
    let new_price_amount =
        if subscription_amount > 0 { subscription_amount } else { remaining_amount };
    if new_price_amount > 0 {
        let label =
            subscription_label.unwrap_or_else(|| format_amount(new_price_amount, &currency));
        preview.new_price = Some(preview_line(new_price_amount, label));
    }

    let balance = invoice.amount_remaining.min(invoice.total);
    if balance != 0 {
        let due = to_major_units(balance, &currency).max(0.0);
        preview.proration_adjustment = Some(due - cart.grand_total);
        preview.base_proration_adjustment = Some(due / rate - cart.grand_total / rate);
    }

    charges.extend(credits);
    let comments = (!charges.is_empty()).then(|| charges.join(", "));
    (preview, comments)
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Price per billing period, e.g. `"10.00 USD per month"` or
/// `"30.00 USD every 3 months"`.
#[must_use]
pub fn format_interval(
    amount: i64,
    currency: &str,
    interval_count: u32,
    interval: Interval,
) -> String {
    let amount = format_amount(amount, currency);
    if interval_count > 1 {
        format!("{} every {} {}s", amount, interval_count, interval)
    } else {
        format!("{} per {}", amount, interval)
    }
}

/// Date shown to customers, e.g. `"5th Mar 2024"`.
#[must_use]
pub fn format_billing_date(timestamp: i64) -> String {
    let Some(date) = DateTime::<Utc>::from_timestamp(timestamp, 0) else {
        return timestamp.to_string();
    };
    let day = date.day();
    let suffix = match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{} {}", day, suffix, date.format("%b %Y"))
}
