//! Subscription billing reconciled against Stripe.
//!
//! The storefront owns carts and orders; Stripe owns recurring billing. This
//! module keeps the two in step:
//!
//! - [`SubscriptionReconciler`] turns a cart into Stripe prices, a coupon and
//!   a subscription, reusing or recreating remote objects as the cart changes.
//! - [`SubscriptionUpdater`] switches an existing subscription to new
//!   products, with or without prorations.
//! - [`WebhookDispatcher`] verifies Stripe events and applies them to local
//!   orders.
//!
//! Every external system sits behind a trait ([`FullStripeClient`],
//! [`OrderGateway`], [`SubscriptionStore`], [`Cache`](crate::traits::Cache)),
//! so the engine can be driven entirely by the mocks in each module's `test`
//! submodule when the `test-billing` feature is enabled.
//!
//! # Example
//!
//! ```rust,ignore
//! use stripe_subsync::billing::{LiveStripeClient, SubscriptionReconciler};
//!
//! let client = LiveStripeClient::new(api_key, (&config.stripe).into())?;
//! let reconciler = SubscriptionReconciler::new(client, InMemoryCache::new(1_000), &config);
//!
//! let initial = InitialPayment::none(&cart.currency);
//! let subscription = reconciler
//!     .reconcile(&cart, previous_subscription_id, &initial, now)
//!     .await?;
//! ```

pub mod audit;
pub mod canonical;
pub mod cart;
pub mod client;
pub mod combined;
pub mod coupon;
pub mod error;
#[cfg(feature = "live-stripe")]
pub mod live_client;
pub mod orders;
pub mod price_cache;
pub mod profile;
pub mod proration;
pub mod reconciler;
pub mod remote;
pub mod storage;
pub mod updates;
pub mod webhook;

pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};
pub use canonical::{Interval, canonical_amount, format_amount};
pub use cart::{
    Cart, ConfigOverride, CouponDuration, CouponRule, LineItem, Order, OrderState, PaymentInfo,
    PaymentMethod, PricingSource, Product, SubscriptionOptions,
};
pub use client::{
    FullStripeClient, StripeCouponClient, StripeCustomerClient, StripeInvoiceClient,
    StripePriceClient, StripeSubscriptionClient,
};
pub use combined::CombinedProfile;
pub use coupon::CouponResolver;
pub use error::{BillingError, WebhookError};
#[cfg(feature = "live-stripe")]
pub use live_client::{InvalidApiKeyError, LiveStripeClient, LiveStripeClientConfig};
pub use orders::{CheckoutDetails, OrderGateway, ShippingMethod};
pub use price_cache::PriceCache;
pub use profile::{ProfileBuilder, SubscriptionProfile, Trial};
pub use proration::{CurrentSubscription, PriceChange, ProrationDecision, ProrationEngine};
pub use reconciler::{InitialPayment, SUBSCRIPTION_EXPAND, SubscriptionReconciler};
pub use storage::{LocalSubscriptionEntry, SubscriptionStore};
pub use updates::{
    CachedUpdateIntentStore, RefundOutcome, SubscriptionUpdater, UpdateIntent, UpdateIntentStore,
    UpdateOutcome, UpdatePreview, UpdateRequest,
};
pub use webhook::{
    WebhookDispatcher, WebhookEvent, WebhookOutcome, WebhookReceiver, event_kind,
};
