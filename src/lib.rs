//! stripe-subsync - storefront subscriptions reconciled with Stripe
//!
//! Carts and orders live in the storefront; recurring billing lives in
//! Stripe. This crate derives a single Stripe subscription from the
//! subscription lines of a cart, keeps it consistent as the cart changes,
//! switches existing subscriptions to new products with or without
//! prorations, and applies Stripe webhook events back to local orders.
//!
//! # Features
//!
//! - **Reconciliation**: memoized prices, coupons and subscriptions per cart
//! - **Updates**: prorated upgrades and downgrades with credit refunds
//! - **Webhooks**: signature verification, idempotency and recurring orders
//! - **Live client**: `async-stripe` transport behind the `live-stripe` feature
//! - **HTTP**: an Axum webhook route behind the `webhook-route` feature
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stripe_subsync::{ConfigBuilder, billing::{LiveStripeClient, WebhookDispatcher}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     stripe_subsync::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let client = LiveStripeClient::new(api_key, (&config.stripe).into())?;
//!     let dispatcher = WebhookDispatcher::new(client, gateway, store, webhook_secret, &config);
//!
//!     let app = stripe_subsync::http::webhook_router(Arc::new(dispatcher));
//!     // serve `app` with axum
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod cache;
mod config;
mod error;
#[cfg(feature = "webhook-route")]
pub mod http;
pub mod traits;
pub mod utils;

pub use cache::InMemoryCache;
pub use config::{
    CacheSettings, ConfigBuilder, LoggingConfig, StripeSettings, SubscriptionSettings,
    SubsyncConfig, TaxSettings,
};
pub use error::{CONTACT_SUPPORT_MESSAGE, Result, SubsyncError};
pub use traits::{Cache, CacheExt};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with defaults.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "info", "subsync::webhook=debug")
/// - `SUBSYNC_LOG_JSON` or `LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = utils::get_env_flag("LOG_JSON").unwrap_or(false);
    install(env_filter, json_logs);
}

/// Initialize tracing from loaded configuration.
pub fn init_tracing_with_config(config: &SubsyncConfig) {
    let env_filter = EnvFilter::new(&config.logging.level);
    install(env_filter, config.logging.json);
}

fn install(env_filter: EnvFilter, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
