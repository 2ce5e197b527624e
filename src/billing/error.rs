//! Billing-specific error types.
//!
//! `BillingError` is the typed taxonomy used across profile building,
//! reconciliation, plan changes and webhooks. `WebhookError` is what the
//! webhook transport sees: a message plus a status hint telling the sender
//! whether to redeliver.

use std::fmt;

/// Billing-specific errors.
///
/// Converted into [`crate::error::SubsyncError::Billing`] when they leave a
/// service, so callers can still match on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// The line item cannot be billed as a subscription.
    NotASubscriptionProduct { product_id: String, reason: String },
    /// Subscription line items use different currencies.
    MixedCurrency { expected: String, found: String },
    /// Subscription line items do not share one billing cadence.
    MustBuySeparately,
    /// Aggregation was asked to combine zero profiles.
    NoSubscriptions,
    /// The checkout has no logged-in customer.
    NotLoggedIn,
    /// The customer session has no cart.
    MissingQuote,
    /// No pending update was recorded for this checkout session.
    MissingUpdateIntent,
    /// The remote subscription items cannot be updated in place.
    UnsupportedItems { message: String },
    /// The cart has no Stripe customer attached.
    MissingCustomer { cart_id: String },
    /// The remote customer already carries a credit balance.
    CreditBalance { balance: i64 },
    /// Checkout contents no longer match the subscription being paid for.
    CartChanged,

    // Reconciliation signals
    /// Remote subscription no longer matches what the cart implies.
    CacheInvalidation { reason: String },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature,
    /// Webhook timestamp is outside the tolerance window.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    // Stripe API errors
    /// Stripe API returned an error.
    StripeApiError {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotASubscriptionProduct { product_id, reason } => {
                write!(f, "Product {} is not a subscription product: {}", product_id, reason)
            }
            Self::MixedCurrency { .. } => {
                write!(f, "It is not possible to buy multiple subscriptions in different currencies.")
            }
            Self::MustBuySeparately => {
                write!(f, "Subscriptions that do not renew together must be bought separately.")
            }
            Self::NoSubscriptions => write!(f, "No subscriptions specified."),
            Self::NotLoggedIn => write!(f, "Please log in and try again."),
            Self::MissingQuote => write!(f, "The customer session does not have a quote."),
            Self::MissingUpdateIntent => write!(
                f,
                "The subscription update details could not be read from the checkout session."
            ),
            Self::UnsupportedItems { message } => write!(f, "{}", message),
            Self::MissingCustomer { cart_id } => {
                write!(f, "Cart {} does not have a Stripe customer.", cart_id)
            }
            Self::CreditBalance { .. } => write!(
                f,
                "A prorated subscription update is not possible because your customer account already has a credit balance. Please contact us for assistance."
            ),
            Self::CartChanged => {
                write!(f, "The cart details have changed. Please refresh the page and try again.")
            }
            Self::CacheInvalidation { reason } => {
                write!(f, "Non-updateable subscription details have changed: {}", reason)
            }
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::StripeApiError { operation, message, code, http_status } => {
                write!(f, "Stripe API error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl BillingError {
    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::NotASubscriptionProduct { .. }
            | Self::MixedCurrency { .. }
            | Self::MustBuySeparately
            | Self::NoSubscriptions
            | Self::NotLoggedIn
            | Self::MissingQuote
            | Self::MissingUpdateIntent
            | Self::UnsupportedItems { .. }
            | Self::MissingCustomer { .. }
            | Self::CreditBalance { .. }
            | Self::CartChanged
            | Self::InvalidWebhookSignature
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. } => true,
            Self::StripeApiError { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            _ => false,
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::Internal { .. } => true,
            Self::StripeApiError { http_status, .. } => {
                matches!(http_status, Some(500..=599) | None)
            }
            _ => false,
        }
    }

    /// Check if an outer retry layer may try again.
    ///
    /// The core itself never retries remote calls.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StripeApiError { http_status, code, .. } => {
                matches!(http_status, Some(408) | Some(429) | Some(500..=599) | None)
                    || code.as_deref() == Some("lock_timeout")
            }
            _ => false,
        }
    }

    /// Whether the message can be shown to the customer as-is.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::MixedCurrency { .. }
                | Self::MustBuySeparately
                | Self::NoSubscriptions
                | Self::NotLoggedIn
                | Self::MissingQuote
                | Self::MissingUpdateIntent
                | Self::UnsupportedItems { .. }
                | Self::CreditBalance { .. }
                | Self::CartChanged
        )
    }
}

/// Failure reported back to the webhook transport.
///
/// `status_code` follows HTTP conventions: 5xx asks the sender to redeliver,
/// 4xx is permanent, 202 acknowledges an event that cannot be linked to a
/// local order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WebhookError {
    pub message: String,
    pub status_code: u16,
}

impl WebhookError {
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        Self { message: message.into(), status_code }
    }

    /// Transient failure; the event should be delivered again.
    pub fn retry_later(message: impl Into<String>) -> Self {
        Self::new(message, 500)
    }

    /// The event can never be processed.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(message, 400)
    }

    /// The event refers to an order that does not exist here.
    pub fn order_not_found(order_id: &str) -> Self {
        Self::new(format!("Received event for order #{} which could not be found.", order_id), 202)
    }

    #[must_use]
    pub fn is_retry_later(&self) -> bool {
        self.status_code >= 500
    }
}

impl From<crate::error::SubsyncError> for WebhookError {
    fn from(err: crate::error::SubsyncError) -> Self {
        match err {
            crate::error::SubsyncError::Webhook(e) => e,
            other if other.is_retryable() || other.status_code() >= 500 => {
                Self::retry_later(other.to_string())
            }
            other => Self::permanent(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BillingError::MixedCurrency { expected: "usd".into(), found: "eur".into() }.to_string(),
            "It is not possible to buy multiple subscriptions in different currencies."
        );
        assert_eq!(
            BillingError::CacheInvalidation { reason: "The discount coupon has changed.".into() }
                .to_string(),
            "Non-updateable subscription details have changed: The discount coupon has changed."
        );

        let err = BillingError::StripeApiError {
            operation: "create_price".to_string(),
            message: "Invalid currency".to_string(),
            code: Some("parameter_invalid".to_string()),
            http_status: Some(400),
        };
        assert_eq!(
            err.to_string(),
            "Stripe API error during 'create_price': Invalid currency (code: parameter_invalid) [HTTP 400]"
        );
    }

    #[test]
    fn test_classification() {
        assert!(BillingError::CartChanged.is_client_error());
        assert!(BillingError::CartChanged.is_user_facing());
        assert!(!BillingError::CacheInvalidation { reason: "x".into() }.is_user_facing());
        assert!(BillingError::internal("boom").is_server_error());

        let rate_limited = BillingError::StripeApiError {
            operation: "retrieve_subscription".to_string(),
            message: "Too many requests".to_string(),
            code: None,
            http_status: Some(429),
        };
        assert!(rate_limited.is_retryable());
        assert!(rate_limited.is_client_error());
    }

    #[test]
    fn test_webhook_error_from_subsync_error() {
        let err: WebhookError = crate::error::SubsyncError::RequestTimeout.into();
        assert_eq!(err.status_code, 500);
        assert!(err.is_retry_later());

        let err: WebhookError =
            crate::error::SubsyncError::Billing(BillingError::InvalidWebhookSignature).into();
        assert_eq!(err.status_code, 400);

        let err = WebhookError::order_not_found("000000123");
        assert_eq!(err.status_code, 202);
        assert!(!err.is_retry_later());
    }
}
