//! Audit logging for billing operations.
//!
//! Every remote mutation the engine performs on behalf of a customer is
//! reported as a [`BillingAuditEvent`], so support can trace what happened to
//! a subscription without digging through request logs.

use async_trait::async_trait;
use std::fmt;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Subscription created for a cart.
    SubscriptionCreated {
        cart_id: String,
        subscription_id: String,
        customer_id: String,
    },
    /// Stale subscription canceled and replaced.
    SubscriptionRecreated {
        cart_id: String,
        old_subscription_id: String,
        new_subscription_id: String,
        reason: String,
    },
    /// Updatable parameters of a subscription changed.
    SubscriptionUpdated {
        cart_id: String,
        subscription_id: String,
    },
    /// Subscription switched to new products.
    SubscriptionPatched {
        subscription_id: String,
        original_order: String,
        prorated: bool,
        new_order: Option<String>,
    },
    /// Subscription canceled by the storefront.
    SubscriptionCanceled {
        subscription_id: String,
    },
    /// Customer credit balance refunded after a downgrade.
    CreditRefunded {
        customer_id: String,
        payment_intent_id: String,
        amount: i64,
    },
    /// Recurring order created from a paid invoice.
    RecurringOrderCreated {
        invoice_id: String,
        order_increment_id: String,
    },
    /// Webhook processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionCreated { cart_id, subscription_id, customer_id } => {
                write!(
                    f,
                    "Subscription created: cart={}, sub={}, customer={}",
                    cart_id, subscription_id, customer_id
                )
            }
            Self::SubscriptionRecreated {
                cart_id,
                old_subscription_id,
                new_subscription_id,
                reason,
            } => {
                write!(
                    f,
                    "Subscription recreated: cart={}, old={}, new={}, reason={}",
                    cart_id, old_subscription_id, new_subscription_id, reason
                )
            }
            Self::SubscriptionUpdated { cart_id, subscription_id } => {
                write!(f, "Subscription updated: cart={}, sub={}", cart_id, subscription_id)
            }
            Self::SubscriptionPatched { subscription_id, original_order, prorated, new_order } => {
                write!(
                    f,
                    "Subscription patched: sub={}, original_order={}, prorated={}, new_order={}",
                    subscription_id,
                    original_order,
                    prorated,
                    new_order.as_deref().unwrap_or("none")
                )
            }
            Self::SubscriptionCanceled { subscription_id } => {
                write!(f, "Subscription canceled: sub={}", subscription_id)
            }
            Self::CreditRefunded { customer_id, payment_intent_id, amount } => {
                write!(
                    f,
                    "Credit refunded: customer={}, pi={}, amount={}",
                    customer_id, payment_intent_id, amount
                )
            }
            Self::RecurringOrderCreated { invoice_id, order_increment_id } => {
                write!(
                    f,
                    "Recurring order created: invoice={}, order={}",
                    invoice_id, order_increment_id
                )
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(
                    f,
                    "Webhook processed: event={}, type={}, outcome={}",
                    event_id, event_type, outcome
                )
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should handle their own failures; audit logging never
/// interrupts billing.
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    async fn log(&self, event: BillingAuditEvent);
}

/// Audit logger that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Logs audit events at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "subsync::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::SubscriptionCreated { .. } => "subscription_created",
        BillingAuditEvent::SubscriptionRecreated { .. } => "subscription_recreated",
        BillingAuditEvent::SubscriptionUpdated { .. } => "subscription_updated",
        BillingAuditEvent::SubscriptionPatched { .. } => "subscription_patched",
        BillingAuditEvent::SubscriptionCanceled { .. } => "subscription_canceled",
        BillingAuditEvent::CreditRefunded { .. } => "credit_refunded",
        BillingAuditEvent::RecurringOrderCreated { .. } => "recurring_order_created",
        BillingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

/// Audit logger that records events in memory.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl BillingAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().await.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::RecordingAuditLogger;
    use super::*;

    #[tokio::test]
    async fn test_recording_logger() {
        let logger = RecordingAuditLogger::new();

        logger
            .log(BillingAuditEvent::SubscriptionCreated {
                cart_id: "12".to_string(),
                subscription_id: "sub_1".to_string(),
                customer_id: "cus_1".to_string(),
            })
            .await;
        logger
            .log(BillingAuditEvent::SubscriptionCanceled { subscription_id: "sub_1".to_string() })
            .await;

        let events = logger.events().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BillingAuditEvent::SubscriptionCreated { .. }));
        assert!(matches!(events[1], BillingAuditEvent::SubscriptionCanceled { .. }));
    }

    #[tokio::test]
    async fn test_noop_logger() {
        NoOpAuditLogger
            .log(BillingAuditEvent::SubscriptionCanceled { subscription_id: "sub_1".to_string() })
            .await;
    }

    #[test]
    fn test_event_display() {
        let event = BillingAuditEvent::SubscriptionPatched {
            subscription_id: "sub_1".to_string(),
            original_order: "000000100".to_string(),
            prorated: true,
            new_order: None,
        };
        let display = event.to_string();
        assert!(display.contains("sub_1"));
        assert!(display.contains("prorated=true"));
        assert!(display.contains("new_order=none"));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(
            event_kind(&BillingAuditEvent::CreditRefunded {
                customer_id: String::new(),
                payment_intent_id: String::new(),
                amount: 0,
            }),
            "credit_refunded"
        );
    }
}
