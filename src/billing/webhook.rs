//! Stripe webhook handling.
//!
//! Deliveries are verified against the signing secret, deduplicated by event
//! id and routed through [`EVENT_TABLE`]. Handlers always re-derive local
//! state from the event object or a fresh remote read, so redelivering an
//! event is safe.

use crate::error::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::canonical::format_amount;
use super::cart::{Order, PaymentMethod};
use super::client::FullStripeClient;
use super::error::{BillingError, WebhookError};
use super::orders::OrderGateway;
use super::remote::{
    BillingReason, Expandable, InvoiceObject, META_ORDER_NUMBER, META_ORIGINAL_ORDER_NUMBER,
    SubscriptionObject, SubscriptionStatus, UpdateSubscriptionParams,
};
use super::storage::{LocalSubscriptionEntry, SubscriptionStore};
use crate::config::SubsyncConfig;

type HandlerResult = std::result::Result<WebhookOutcome, WebhookError>;

/// Parsed webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    /// Event type (e.g. `invoice.payment_succeeded`).
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// Snapshot of the object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// A renewal invoice was paid and a new local order placed.
    RecurringOrderCreated { order_increment_id: String },
    /// The event belongs to a flow that records the outcome itself.
    Suppressed,
    /// The event is handled by a different event type.
    Skipped,
    /// Not relevant to this store.
    Ignored,
    /// Event id seen before.
    AlreadyProcessed,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::RecurringOrderCreated { .. } => "recurring_order_created",
            Self::Suppressed => "suppressed",
            Self::Skipped => "skipped",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

/// Handler families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaid,
    InvoiceVoided,
    ChargeSucceeded,
    ChargeRefunded,
    PaymentFailed,
    IntentCanceled,
    SetupIntentSucceeded,
    CheckoutSessionExpired,
}

/// Event types this crate reacts to.
pub const EVENT_TABLE: &[(&str, EventKind)] = &[
    ("customer.subscription.created", EventKind::SubscriptionCreated),
    ("customer.subscription.updated", EventKind::SubscriptionUpdated),
    ("customer.subscription.deleted", EventKind::SubscriptionDeleted),
    ("invoice.payment_succeeded", EventKind::InvoicePaymentSucceeded),
    ("invoice.paid", EventKind::InvoicePaid),
    ("invoice.voided", EventKind::InvoiceVoided),
    ("invoice.marked_uncollectible", EventKind::InvoiceVoided),
    ("charge.succeeded", EventKind::ChargeSucceeded),
    ("charge.refunded", EventKind::ChargeRefunded),
    ("payment_intent.payment_failed", EventKind::PaymentFailed),
    ("setup_intent.setup_failed", EventKind::PaymentFailed),
    ("payment_intent.canceled", EventKind::IntentCanceled),
    ("setup_intent.canceled", EventKind::IntentCanceled),
    ("setup_intent.succeeded", EventKind::SetupIntentSucceeded),
    ("checkout.session.expired", EventKind::CheckoutSessionExpired),
];

#[must_use]
pub fn event_kind(event_type: &str) -> Option<EventKind> {
    EVENT_TABLE
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, kind)| *kind)
}

const ABANDONED_CART_MESSAGE: &str = "Customer abandoned the cart. The payment session has expired.";

#[derive(Debug, Clone, Default, Deserialize)]
struct IntentError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChargeOutcome {
    #[serde(default)]
    seller_message: Option<String>,
}

/// Payment or setup intent as delivered in an event.
#[derive(Debug, Clone, Deserialize)]
struct IntentSnapshot {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    cancellation_reason: Option<String>,
    #[serde(default)]
    last_payment_error: Option<IntentError>,
    #[serde(default)]
    last_setup_error: Option<IntentError>,
    #[serde(default)]
    failure_message: Option<String>,
    #[serde(default)]
    outcome: Option<ChargeOutcome>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChargeSnapshot {
    id: String,
    #[serde(default)]
    invoice: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    captured: bool,
    #[serde(default)]
    amount_captured: i64,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckoutSessionSnapshot {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Where an event's order lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OrderLink {
    Order(String),
    /// Subscription updated without a new order; the next renewal reorders
    /// from the cart recorded on the local entry.
    UpdatedInPlace { subscription_id: String },
    Unlinked,
}

fn metadata_order(metadata: &HashMap<String, String>) -> Option<String> {
    metadata
        .get(META_ORDER_NUMBER)
        .filter(|s| !s.is_empty())
        .cloned()
}

fn subscription_link(subscription: &SubscriptionObject) -> OrderLink {
    if let Some(order) = subscription.order_increment_id() {
        return OrderLink::Order(order.to_string());
    }
    if subscription
        .metadata
        .get(META_ORIGINAL_ORDER_NUMBER)
        .is_some_and(|s| !s.is_empty())
    {
        return OrderLink::UpdatedInPlace { subscription_id: subscription.id.clone() };
    }
    OrderLink::Unlinked
}

fn parse<T: serde::de::DeserializeOwned>(
    object: &serde_json::Value,
) -> std::result::Result<T, WebhookError> {
    serde_json::from_value(object.clone()).map_err(|e| {
        tracing::warn!(target: "subsync::webhook", error = %e, "Unexpected webhook event object");
        WebhookError::permanent(format!("Invalid event object: {}", e))
    })
}

/// Verifies and dispatches Stripe webhook deliveries.
///
/// The signing secret is a [`SecretString`] and never shows up in debug
/// output.
pub struct WebhookDispatcher<C> {
    client: C,
    gateway: Arc<dyn OrderGateway>,
    store: Arc<dyn SubscriptionStore>,
    audit: Arc<dyn BillingAuditLogger>,
    webhook_secret: SecretString,
    tolerance_seconds: i64,
}

impl<C: FullStripeClient> WebhookDispatcher<C> {
    #[must_use]
    pub fn new(
        client: C,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn SubscriptionStore>,
        webhook_secret: impl Into<SecretString>,
        config: &SubsyncConfig,
    ) -> Self {
        Self {
            client,
            gateway,
            store,
            audit: Arc::new(TracingAuditLogger),
            webhook_secret: webhook_secret.into(),
            tolerance_seconds: config.stripe.webhook_tolerance_seconds,
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Verify the `Stripe-Signature` header and parse the event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        self.verify_signature_at(payload, signature, chrono::Utc::now().timestamp())
    }

    /// [`verify_signature`](Self::verify_signature) against a fixed clock.
    pub fn verify_signature_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> Result<WebhookEvent> {
        let parts = parse_signature_header(signature)?;

        let age = (now - parts.timestamp).abs();
        if age > self.tolerance_seconds {
            return Err(BillingError::WebhookTimestampExpired { age_seconds: age }.into());
        }

        let mut signed_payload = format!("{}.", parts.timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = compute_signature(self.webhook_secret.expose_secret(), &signed_payload)?;

        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate).is_ok_and(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
        });
        if !matched {
            return Err(BillingError::InvalidWebhookSignature.into());
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(target: "subsync::webhook", error = %e, "Failed to parse webhook payload");
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
            .into()
        })
    }

    /// Process a verified event once per event id.
    ///
    /// Failures are logged and returned so the sender can redeliver; handlers
    /// are safe to re-run.
    pub async fn handle_event(&self, event: &WebhookEvent) -> HandlerResult {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(target: "subsync::webhook", event_id = %event.id, "Event already processed");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match self.dispatch(&event.event_type, &event.data.object).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.status_code == 202 {
                    tracing::warn!(
                        target: "subsync::webhook",
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "{}", e
                    );
                } else {
                    tracing::error!(
                        target: "subsync::webhook",
                        event_id = %event.id,
                        event_type = %event.event_type,
                        status = e.status_code,
                        "Webhook handler failed: {}", e
                    );
                }
                return Err(e);
            }
        };

        if outcome != WebhookOutcome::Ignored {
            self.store.mark_event_processed(&event.id).await?;
        }

        tracing::info!(
            target: "subsync::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "Webhook processed"
        );
        self.audit
            .log(BillingAuditEvent::WebhookProcessed {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                outcome: outcome.as_str().to_string(),
            })
            .await;

        Ok(outcome)
    }

    /// Route one event object to its handler.
    pub async fn dispatch(&self, event_type: &str, object: &serde_json::Value) -> HandlerResult {
        let Some(kind) = event_kind(event_type) else {
            return Ok(WebhookOutcome::Ignored);
        };

        match kind {
            EventKind::SubscriptionCreated => self.on_subscription_created(parse(object)?).await,
            EventKind::SubscriptionUpdated => self.on_subscription_updated(parse(object)?).await,
            EventKind::SubscriptionDeleted => self.on_subscription_deleted(parse(object)?).await,
            EventKind::InvoicePaymentSucceeded => {
                self.on_invoice_payment_succeeded(parse(object)?).await
            }
            EventKind::InvoicePaid => self.on_invoice_paid(parse(object)?).await,
            EventKind::InvoiceVoided => self.on_invoice_voided(parse(object)?).await,
            EventKind::ChargeSucceeded => self.on_charge_succeeded(parse(object)?).await,
            EventKind::ChargeRefunded => self.on_charge_refunded(parse(object)?).await,
            EventKind::PaymentFailed => self.on_payment_failed(parse(object)?).await,
            EventKind::IntentCanceled => self.on_intent_canceled(parse(object)?).await,
            EventKind::SetupIntentSucceeded => self.on_setup_intent_succeeded(parse(object)?).await,
            EventKind::CheckoutSessionExpired => {
                self.on_checkout_session_expired(parse(object)?).await
            }
        }
    }

    async fn load_order(&self, increment_id: &str) -> std::result::Result<Order, WebhookError> {
        self.gateway
            .load_order(increment_id)
            .await?
            .ok_or_else(|| WebhookError::order_not_found(increment_id))
    }

    async fn upsert_entry(
        &self,
        subscription: &SubscriptionObject,
        order: Option<&Order>,
    ) -> Result<LocalSubscriptionEntry> {
        let entry = match self.store.get_entry(&subscription.id).await? {
            Some(mut entry) => {
                entry.refresh(subscription, order);
                entry
            }
            None => LocalSubscriptionEntry::init_from(
                subscription,
                order,
                chrono::Utc::now().timestamp(),
            ),
        };
        self.store.save_entry(&entry).await?;
        Ok(entry)
    }

    async fn on_subscription_created(&self, subscription: SubscriptionObject) -> HandlerResult {
        let early = matches!(
            subscription.status,
            SubscriptionStatus::Incomplete | SubscriptionStatus::Trialing
        );

        let order = match subscription_link(&subscription) {
            OrderLink::Order(id) => match self.load_order(&id).await {
                Ok(order) => Some(order),
                Err(e) if early => {
                    tracing::debug!(target: "subsync::webhook", subscription_id = %subscription.id, "{}", e);
                    None
                }
                Err(e) => return Err(e),
            },
            // Created by an embedded payment form before the order exists
            _ if early => None,
            _ => return Ok(WebhookOutcome::Ignored),
        };

        self.upsert_entry(&subscription, order.as_ref()).await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_subscription_updated(&self, subscription: SubscriptionObject) -> HandlerResult {
        match subscription_link(&subscription) {
            OrderLink::Order(id) => {
                let order = self.load_order(&id).await?;
                self.upsert_entry(&subscription, Some(&order)).await?;
                Ok(WebhookOutcome::Processed)
            }
            // No order is placed until the updated subscription is paid for
            OrderLink::UpdatedInPlace { .. } => {
                self.upsert_entry(&subscription, None).await?;
                Ok(WebhookOutcome::Processed)
            }
            OrderLink::Unlinked => Ok(WebhookOutcome::Ignored),
        }
    }

    async fn on_subscription_deleted(&self, subscription: SubscriptionObject) -> HandlerResult {
        let Some(entry) = self.store.get_entry(&subscription.id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        if let Some(cart_id) = &entry.reorder_from_quote_id {
            if let Err(e) = self.gateway.release_recurring_cart(cart_id).await {
                tracing::warn!(target: "subsync::webhook", cart_id = %cart_id, error = %e, "Could not release update cart");
            }
        }
        self.store.delete_entry(&subscription.id).await?;
        Ok(WebhookOutcome::Processed)
    }

    /// Re-read the invoice with its subscription and payment intent expanded.
    async fn fresh_invoice(&self, invoice_id: &str) -> Result<InvoiceObject> {
        self.client
            .retrieve_invoice(invoice_id, &["subscription", "payment_intent"])
            .await
    }

    fn invoice_link(invoice: &InvoiceObject) -> OrderLink {
        if let Some(order) = metadata_order(&invoice.metadata) {
            return OrderLink::Order(order);
        }
        invoice
            .subscription
            .as_ref()
            .and_then(Expandable::as_object)
            .map(subscription_link)
            .unwrap_or(OrderLink::Unlinked)
    }

    async fn on_invoice_payment_succeeded(&self, event_invoice: InvoiceObject) -> HandlerResult {
        if event_invoice.subscription.is_none() {
            return Ok(WebhookOutcome::Ignored);
        }
        let invoice = self.fresh_invoice(&event_invoice.id).await?;
        let reason = invoice.billing_reason.or(event_invoice.billing_reason);

        match Self::invoice_link(&invoice) {
            OrderLink::Unlinked => Ok(WebhookOutcome::Ignored),
            OrderLink::UpdatedInPlace { subscription_id } => match reason {
                Some(BillingReason::SubscriptionCycle) => {
                    self.reorder_after_update(&invoice, &subscription_id).await
                }
                // The first invoice after an update belongs to the update flow
                _ => Ok(WebhookOutcome::Suppressed),
            },
            OrderLink::Order(id) => {
                let order = self.load_order(&id).await?;
                match reason {
                    Some(BillingReason::SubscriptionUpdate) => Ok(WebhookOutcome::Suppressed),
                    Some(BillingReason::SubscriptionCreate) => {
                        self.start_subscription(&invoice, &order).await
                    }
                    _ => self.create_recurring_order(&invoice).await,
                }
            }
        }
    }

    /// First payment of a new subscription: link it to its order.
    async fn start_subscription(&self, invoice: &InvoiceObject, order: &Order) -> HandlerResult {
        let Some(subscription) = invoice.subscription.as_ref().and_then(Expandable::as_object)
        else {
            return Err(WebhookError::retry_later(format!(
                "The subscription of invoice {} could not be read.",
                invoice.id
            )));
        };
        self.upsert_entry(subscription, Some(order)).await?;

        let mut params = UpdateSubscriptionParams::default();
        if subscription.default_payment_method.is_none() {
            params.default_payment_method = invoice
                .payment_intent
                .as_ref()
                .and_then(Expandable::as_object)
                .and_then(|pi| pi.payment_method.clone());
        }
        if subscription.order_increment_id().is_none() {
            params.metadata =
                Some([(META_ORDER_NUMBER.to_string(), order.increment_id.clone())].into());
        }
        if params.default_payment_method.is_some() || params.metadata.is_some() {
            self.client.update_subscription(&subscription.id, &params).await?;
        }

        // No charge event follows a fully trialed order
        if subscription.status == SubscriptionStatus::Trialing
            && invoice.amount_paid == 0
            && invoice.total == 0
        {
            self.gateway.invoice_order_offline(&order.increment_id, None).await?;
            if order.base_grand_total > 0.0 {
                self.gateway
                    .refund_order_offline(&order.increment_id, order.base_grand_total)
                    .await?;
            }
            self.gateway
                .set_processing(&order.increment_id, "Trial subscription started.")
                .await?;
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn claim_invoice(
        &self,
        invoice_id: &str,
    ) -> std::result::Result<Option<String>, WebhookError> {
        let key = format!("invoice:{}", invoice_id);
        if self.store.claim(&key).await? {
            Ok(Some(key))
        } else {
            tracing::info!(target: "subsync::webhook", invoice_id, "Recurring order already created for invoice");
            Ok(None)
        }
    }

    async fn recurring_order_created(&self, invoice_id: &str, order: &Order) -> HandlerResult {
        tracing::info!(
            target: "subsync::webhook",
            invoice_id,
            order = %order.increment_id,
            "Created recurring order"
        );
        self.audit
            .log(BillingAuditEvent::RecurringOrderCreated {
                invoice_id: invoice_id.to_string(),
                order_increment_id: order.increment_id.clone(),
            })
            .await;
        Ok(WebhookOutcome::RecurringOrderCreated { order_increment_id: order.increment_id.clone() })
    }

    async fn create_recurring_order(&self, invoice: &InvoiceObject) -> HandlerResult {
        let Some(key) = self.claim_invoice(&invoice.id).await? else {
            return Ok(WebhookOutcome::AlreadyProcessed);
        };

        match self.gateway.create_recurring_order_from_invoice(invoice).await {
            Ok(order) => self.recurring_order_created(&invoice.id, &order).await,
            Err(e) => {
                self.release_claim(&key).await;
                Err(WebhookError::retry_later(format!(
                    "Could not create recurring order from invoice {}: {}",
                    invoice.id, e
                )))
            }
        }
    }

    /// First renewal after an in-place update: order from the update cart and
    /// point the subscription at the new order.
    async fn reorder_after_update(
        &self,
        invoice: &InvoiceObject,
        subscription_id: &str,
    ) -> HandlerResult {
        let Some(mut entry) = self.store.get_entry(subscription_id).await? else {
            return Err(WebhookError::retry_later(format!(
                "Subscription {} is not recorded locally yet.",
                subscription_id
            )));
        };
        let Some(cart_id) = entry.reorder_from_quote_id.clone() else {
            return Err(WebhookError::permanent(format!(
                "Subscription {} was updated without a new order but has no cart to reorder from.",
                subscription_id
            )));
        };
        let Some(key) = self.claim_invoice(&invoice.id).await? else {
            return Ok(WebhookOutcome::AlreadyProcessed);
        };

        let order = match self
            .gateway
            .create_recurring_order_from_cart(&cart_id, &invoice.id)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.release_claim(&key).await;
                return Err(WebhookError::retry_later(format!(
                    "Could not create recurring order from cart {}: {}",
                    cart_id, e
                )));
            }
        };

        let params = UpdateSubscriptionParams {
            metadata: Some(
                [
                    (META_ORDER_NUMBER.to_string(), order.increment_id.clone()),
                    (META_ORIGINAL_ORDER_NUMBER.to_string(), String::new()),
                ]
                .into(),
            ),
            ..Default::default()
        };
        // The order exists from here on; a redelivery would only find the claim
        match self.client.update_subscription(subscription_id, &params).await {
            Ok(subscription) => entry.refresh(&subscription, Some(&order)),
            Err(e) => {
                tracing::error!(
                    target: "subsync::webhook",
                    subscription_id,
                    order = %order.increment_id,
                    error = %e,
                    "Recurring order created but the subscription still points at the previous order"
                );
                entry.link_order(&order);
            }
        }
        entry.reorder_from_quote_id = None;
        if let Err(e) = self.store.save_entry(&entry).await {
            tracing::error!(
                target: "subsync::webhook",
                subscription_id,
                error = %e,
                "Recurring order created but the local subscription was not updated"
            );
        }
        if let Err(e) = self.gateway.release_recurring_cart(&cart_id).await {
            tracing::warn!(target: "subsync::webhook", cart_id = %cart_id, error = %e, "Could not release update cart");
        }

        self.recurring_order_created(&invoice.id, &order).await
    }

    async fn release_claim(&self, key: &str) {
        if let Err(e) = self.store.release(key).await {
            tracing::error!(target: "subsync::webhook", key, error = %e, "Could not release idempotency claim");
        }
    }

    async fn invoice_order(
        &self,
        invoice: &InvoiceObject,
    ) -> std::result::Result<Option<Order>, WebhookError> {
        let link = match metadata_order(&invoice.metadata) {
            Some(id) => OrderLink::Order(id),
            None => Self::invoice_link(&self.fresh_invoice(&invoice.id).await?),
        };
        match link {
            OrderLink::Order(id) => Ok(Some(self.load_order(&id).await?)),
            _ => Ok(None),
        }
    }

    async fn on_invoice_paid(&self, invoice: InvoiceObject) -> HandlerResult {
        let Some(order) = self.invoice_order(&invoice).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        if order.payment.method != PaymentMethod::Invoice {
            return Ok(WebhookOutcome::Skipped);
        }

        let transaction_id = invoice.payment_intent.as_ref().map(Expandable::id);
        self.gateway
            .invoice_order_offline(&order.increment_id, transaction_id)
            .await?;
        self.gateway
            .set_processing(&order.increment_id, "The customer has paid the invoice for this order.")
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_invoice_voided(&self, invoice: InvoiceObject) -> HandlerResult {
        let Some(order) = self.invoice_order(&invoice).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        if order.payment.method != PaymentMethod::Invoice {
            return Ok(WebhookOutcome::Skipped);
        }

        self.gateway.cancel_order(&order.increment_id).await?;
        self.gateway
            .add_order_comment(&order.increment_id, "The invoice was voided from the Stripe Dashboard.")
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_charge_succeeded(&self, charge: ChargeSnapshot) -> HandlerResult {
        if let Some(invoice_id) = &charge.invoice {
            let invoice = self.client.retrieve_invoice(invoice_id, &[]).await?;
            // Renewals are credited by the invoice path
            if invoice.billing_reason.is_some_and(|r| r.is_recurring_charge()) {
                tracing::debug!(
                    target: "subsync::webhook",
                    charge_id = %charge.id,
                    invoice_id = %invoice_id,
                    "Skipping charge of a recurring invoice"
                );
                return Ok(WebhookOutcome::Skipped);
            }
        }

        let Some(order_id) = metadata_order(&charge.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        let Some(payment_intent) = charge.payment_intent.as_deref() else {
            return Err(WebhookError::permanent("This charge was not created by a payment intent."));
        };

        let captured = if charge.captured { charge.amount_captured } else { 0 };
        if captured > 0 && order.is_pending_payment() {
            self.gateway
                .invoice_order_offline(&order.increment_id, Some(payment_intent))
                .await?;
            let comment = format!(
                "Captured amount of {} via Stripe. Transaction ID: {}",
                format_amount(captured, &charge.currency),
                payment_intent
            );
            self.gateway.set_processing(&order.increment_id, &comment).await?;
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn on_charge_refunded(&self, charge: ChargeSnapshot) -> HandlerResult {
        let Some(order_id) = metadata_order(&charge.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        if charge.amount_refunded > 0 {
            self.gateway
                .record_refund(&order.increment_id, charge.amount_refunded, &charge.currency)
                .await?;
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn on_payment_failed(&self, intent: IntentSnapshot) -> HandlerResult {
        let Some(order_id) = metadata_order(&intent.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        let (message, expired) = failure_message(&intent);
        if expired {
            self.gateway.cancel_order(&order.increment_id).await?;
        }
        self.gateway.add_order_comment(&order.increment_id, &message).await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_intent_canceled(&self, intent: IntentSnapshot) -> HandlerResult {
        if intent.status.as_deref() != Some("canceled") {
            return Ok(WebhookOutcome::Skipped);
        }
        let Some(order_id) = metadata_order(&intent.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        if intent.cancellation_reason.as_deref() == Some("abandoned") {
            self.gateway
                .add_order_comment(&order.increment_id, ABANDONED_CART_MESSAGE)
                .await?;
            self.gateway.cancel_order(&order.increment_id).await?;
        }
        Ok(WebhookOutcome::Processed)
    }

    /// Trial orders get no charge event; fulfil them when the card is saved.
    async fn on_setup_intent_succeeded(&self, intent: IntentSnapshot) -> HandlerResult {
        let Some(order_id) = metadata_order(&intent.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        let Some(entry) = self.store.find_by_order(&order.increment_id).await? else {
            return Ok(WebhookOutcome::Skipped);
        };
        let subscription = self.client.retrieve_subscription(&entry.subscription_id, &[]).await?;

        let mut params = UpdateSubscriptionParams::default();
        if subscription.order_increment_id().is_none() {
            params.metadata =
                Some([(META_ORDER_NUMBER.to_string(), order.increment_id.clone())].into());
        }
        params.default_payment_method = intent.payment_method.clone();
        if params.metadata.is_some() || params.default_payment_method.is_some() {
            self.client.update_subscription(&subscription.id, &params).await?;
        }

        if subscription.status != SubscriptionStatus::Trialing {
            return Ok(WebhookOutcome::Processed);
        }

        let comment = format!("Your trial period for order #{} has started.", order.increment_id);
        self.gateway.set_processing(&order.increment_id, &comment).await?;

        if order.grand_total == 0.0 {
            self.gateway.invoice_order_offline(&order.increment_id, None).await?;
            if order.base_grand_total > 0.0 {
                self.gateway
                    .refund_order_offline(&order.increment_id, order.base_grand_total)
                    .await?;
            }
        }
        tracing::debug!(target: "subsync::webhook", setup_intent = %intent.id, "Trial started");
        Ok(WebhookOutcome::Processed)
    }

    async fn on_checkout_session_expired(&self, session: CheckoutSessionSnapshot) -> HandlerResult {
        let Some(order_id) = metadata_order(&session.metadata) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let order = self.load_order(&order_id).await?;

        self.gateway
            .add_order_comment(&order.increment_id, "Stripe Checkout session has expired without a payment.")
            .await?;
        if order.is_pending_payment() && order.payment.method == PaymentMethod::Checkout {
            self.gateway.cancel_order(&order.increment_id).await?;
        }
        tracing::debug!(target: "subsync::webhook", session_id = %session.id, "Checkout session expired");
        Ok(WebhookOutcome::Processed)
    }
}

/// Order comment for a failed payment and whether the session expired.
fn failure_message(intent: &IntentSnapshot) -> (String, bool) {
    let last_error = [&intent.last_payment_error, &intent.last_setup_error]
        .into_iter()
        .flatten()
        .find(|e| e.message.as_deref().is_some_and(|m| !m.is_empty()));

    if let Some(error) = last_error {
        let message = error.message.as_deref().unwrap_or_default();
        return match error.code.as_deref() {
            Some("payment_intent_authentication_failure") => {
                ("Payment authentication failed.".to_string(), false)
            }
            Some("payment_intent_payment_attempt_failed") if message.contains("expired") => {
                (ABANDONED_CART_MESSAGE.to_string(), true)
            }
            _ => (format!("Payment failed: {}", message), false),
        };
    }

    if let Some(message) = intent.failure_message.as_deref().filter(|m| !m.is_empty()) {
        return (format!("Payment failed: {}", message), false);
    }
    if let Some(message) = intent
        .outcome
        .as_ref()
        .and_then(|o| o.seller_message.as_deref())
        .filter(|m| !m.is_empty())
    {
        return (format!("Payment failed: {}", message), false);
    }
    ("Payment failed.".to_string(), false)
}

/// Dispatcher seen by the HTTP layer.
#[async_trait]
pub trait WebhookReceiver: Send + Sync {
    /// Verify, deduplicate and process one delivery.
    async fn receive(&self, payload: &[u8], signature: &str) -> HandlerResult;
}

#[async_trait]
impl<C: FullStripeClient> WebhookReceiver for WebhookDispatcher<C> {
    async fn receive(&self, payload: &[u8], signature: &str) -> HandlerResult {
        let event = self.verify_signature(payload, signature).map_err(|e| {
            tracing::warn!(target: "subsync::webhook", error = %e, "Rejected webhook delivery");
            WebhookError::permanent(e.to_string())
        })?;
        self.handle_event(&event).await
    }
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse the `Stripe-Signature` header (`t=...,v1=...[,v1=...]`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidWebhookSignature)?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidWebhookSignature)?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidWebhookSignature.into());
    }
    Ok(SignatureParts { timestamp, signatures })
}

/// HMAC-SHA256 of `payload` under `secret`.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::internal("HMAC key rejected"))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Header value for a payload, as Stripe would sign it.
#[cfg(any(test, feature = "test-billing"))]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut signed_payload = format!("{}.", timestamp).into_bytes();
    signed_payload.extend_from_slice(payload);
    let signature = compute_signature(secret, &signed_payload).map(hex::encode).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}
