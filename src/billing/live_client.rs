//! Live Stripe client.
//!
//! Talks to the Stripe REST API through `async-stripe`'s transport, sending
//! this crate's own request bodies and decoding into the reduced objects in
//! [`remote`](super::remote). Calls are bounded by a timeout and never
//! retried; a failed call surfaces to the caller as a [`BillingError`].

use crate::config::StripeSettings;
use crate::error::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use super::client::{
    StripeCouponClient, StripeCustomerClient, StripeInvoiceClient, StripePriceClient,
    StripeSubscriptionClient,
};
use super::error::BillingError;
use super::remote::{
    CouponObject, CreateCouponParams, CustomerObject, InvoiceObject, PriceObject, PriceShape,
    RefundObject, SubscriptionObject, SubscriptionParams, UpcomingInvoiceParams,
    UpdateSubscriptionParams,
};

/// Configuration for the live client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Per-request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

impl LiveStripeClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

impl From<&StripeSettings> for LiveStripeClientConfig {
    fn from(settings: &StripeSettings) -> Self {
        Self { timeout_seconds: settings.timeout_seconds }
    }
}

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Stripe API key: {reason}")]
pub struct InvalidApiKeyError {
    pub reason: String,
}

/// Accepts secret (`sk_`) and restricted (`rk_`) keys in test or live mode.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError { reason: "API key cannot be empty".to_string() });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

/// Reject identifiers that would change the request path.
fn path_id<'a>(kind: &str, id: &'a str) -> Result<&'a str> {
    if id.is_empty() || id.contains(['/', '?', '#']) {
        return Err(crate::error::SubsyncError::bad_request(format!("Invalid {} ID: {}", kind, id)));
    }
    Ok(id)
}

#[derive(Serialize)]
struct ExpandQuery<'a> {
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    expand: &'a [&'a str],
}

#[derive(Serialize)]
struct BalanceUpdate {
    balance: i64,
}

#[derive(Serialize)]
struct RefundParams<'a> {
    payment_intent: &'a str,
    amount: i64,
}

#[derive(Serialize)]
struct NoParams {}

/// Live Stripe client.
///
/// Mutating calls that create objects carry an idempotency key so a
/// connection reset cannot create the same subscription twice.
#[derive(Clone)]
pub struct LiveStripeClient {
    client: stripe::Client,
    config: LiveStripeClientConfig,
    api_key: SecretString,
}

impl LiveStripeClient {
    /// Create a client from a validated API key.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidApiKeyError`] when the key is not a secret or
    /// restricted key.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeClientConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            env!("CARGO_PKG_NAME").to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self { client, config, api_key })
    }

    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveStripeClientConfig::default())
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_live_") || key.starts_with("rk_live_")
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        self.client.clone().with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    /// Await a request under the configured timeout.
    async fn send<T, F>(&self, operation: &str, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        tracing::debug!(target: "subsync::stripe", operation, "Calling Stripe");

        let outcome = match tokio::time::timeout(self.timeout(), request).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => map_stripe_error(error, operation),
            Err(_) => BillingError::StripeApiError {
                operation: operation.to_string(),
                message: "Request timed out".to_string(),
                code: None,
                http_status: Some(408),
            },
        };

        tracing::warn!(
            target: "subsync::stripe",
            operation,
            error = %outcome,
            "Stripe request failed"
        );
        Err(outcome.into())
    }
}

impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> BillingError {
    match error {
        stripe::StripeError::Stripe(request_error) => BillingError::StripeApiError {
            operation: operation.to_string(),
            message: request_error.message.clone().unwrap_or_else(|| "Unknown error".to_string()),
            code: request_error.code.as_ref().map(|c| format!("{c:?}")),
            http_status: Some(request_error.http_status),
        },
        stripe::StripeError::QueryStringSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize request: {e}"),
        },
        stripe::StripeError::JSONSerialize(e) => BillingError::Internal {
            message: format!("Failed to decode response: {e}"),
        },
        stripe::StripeError::UnsupportedVersion => BillingError::Internal {
            message: "Unsupported Stripe API version".to_string(),
        },
        stripe::StripeError::ClientError(msg) => BillingError::StripeApiError {
            operation: operation.to_string(),
            message: format!("HTTP client error: {msg}"),
            code: None,
            http_status: Some(503),
        },
        stripe::StripeError::Timeout => BillingError::StripeApiError {
            operation: operation.to_string(),
            message: "Request timed out".to_string(),
            code: None,
            http_status: Some(408),
        },
    }
}

#[async_trait]
impl StripeSubscriptionClient for LiveStripeClient {
    async fn create_subscription(&self, params: &SubscriptionParams) -> Result<SubscriptionObject> {
        let client = self.idempotent_client("create_subscription");
        self.send("create_subscription", client.post_form("/subscriptions", params)).await
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        expand: &[&str],
    ) -> Result<SubscriptionObject> {
        let path = format!("/subscriptions/{}", path_id("subscription", subscription_id)?);
        self.send(
            "retrieve_subscription",
            self.client.get_query(&path, ExpandQuery { expand }),
        )
        .await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
    ) -> Result<SubscriptionObject> {
        let path = format!("/subscriptions/{}", path_id("subscription", subscription_id)?);
        self.send("update_subscription", self.client.post_form(&path, params)).await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionObject> {
        let path = format!("/subscriptions/{}", path_id("subscription", subscription_id)?);
        self.send("cancel_subscription", self.client.delete(&path)).await
    }
}

#[async_trait]
impl StripePriceClient for LiveStripeClient {
    async fn create_price(&self, shape: &PriceShape) -> Result<PriceObject> {
        let client = self.idempotent_client("create_price");
        self.send("create_price", client.post_form("/prices", shape)).await
    }

    async fn retrieve_price(&self, price_id: &str) -> Result<PriceObject> {
        let path = format!("/prices/{}", path_id("price", price_id)?);
        self.send("retrieve_price", self.client.get_query(&path, NoParams {})).await
    }
}

#[async_trait]
impl StripeInvoiceClient for LiveStripeClient {
    async fn retrieve_invoice(&self, invoice_id: &str, expand: &[&str]) -> Result<InvoiceObject> {
        let path = format!("/invoices/{}", path_id("invoice", invoice_id)?);
        self.send("retrieve_invoice", self.client.get_query(&path, ExpandQuery { expand })).await
    }

    async fn upcoming_invoice(&self, params: &UpcomingInvoiceParams) -> Result<InvoiceObject> {
        self.send("upcoming_invoice", self.client.get_query("/invoices/upcoming", params)).await
    }
}

#[async_trait]
impl StripeCouponClient for LiveStripeClient {
    async fn retrieve_coupon(&self, coupon_id: &str) -> Result<CouponObject> {
        let path = format!("/coupons/{}", path_id("coupon", coupon_id)?);
        self.send("retrieve_coupon", self.client.get_query(&path, NoParams {})).await
    }

    async fn create_coupon(&self, params: &CreateCouponParams) -> Result<CouponObject> {
        let client = self.idempotent_client("create_coupon");
        self.send("create_coupon", client.post_form("/coupons", params)).await
    }
}

#[async_trait]
impl StripeCustomerClient for LiveStripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerObject> {
        let path = format!("/customers/{}", path_id("customer", customer_id)?);
        self.send("retrieve_customer", self.client.get_query(&path, NoParams {})).await
    }

    async fn update_customer_balance(
        &self,
        customer_id: &str,
        balance: i64,
    ) -> Result<CustomerObject> {
        let path = format!("/customers/{}", path_id("customer", customer_id)?);
        self.send(
            "update_customer_balance",
            self.client.post_form(&path, BalanceUpdate { balance }),
        )
        .await
    }

    async fn create_refund(&self, payment_intent_id: &str, amount: i64) -> Result<RefundObject> {
        let client = self.idempotent_client("create_refund");
        self.send(
            "create_refund",
            client.post_form(
                "/refunds",
                RefundParams { payment_intent: payment_intent_id, amount },
            ),
        )
        .await
    }
}
