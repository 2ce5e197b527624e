//! Local commerce records as the engine sees them.
//!
//! Carts, orders and products are owned by the storefront. These types carry
//! only the fields subscription billing reads; the [`OrderGateway`] loads and
//! mutates the real records.
//!
//! [`OrderGateway`]: super::orders::OrderGateway

use super::canonical::Interval;
use serde::{Deserialize, Serialize};

/// Three-way product setting that can defer to the store default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOverride {
    #[default]
    UseDefault,
    Disabled,
    Enabled,
}

impl ConfigOverride {
    /// Resolve against the store-wide default.
    #[must_use]
    pub fn resolve(self, default: bool) -> bool {
        match self {
            Self::UseDefault => default,
            Self::Disabled => false,
            Self::Enabled => true,
        }
    }
}

/// Subscription attributes of a catalog product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub enabled: bool,
    pub interval: Option<Interval>,
    pub interval_count: Option<u32>,
    /// Free trial length; only positive values start a trial
    #[serde(default)]
    pub trial_days: Option<u32>,
    /// One-off fee charged with the first invoice, in base currency
    #[serde(default)]
    pub initial_fee: f64,
    #[serde(default)]
    pub upgrades_downgrades: ConfigOverride,
    #[serde(default)]
    pub prorate_upgrades: ConfigOverride,
    #[serde(default)]
    pub prorate_downgrades: ConfigOverride,
}

/// Catalog product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// No shipment or fulfillment needed
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub subscription: Option<SubscriptionOptions>,
}

impl Product {
    /// Subscription options when the product is billed as a subscription.
    #[must_use]
    pub fn subscription_options(&self) -> Option<&SubscriptionOptions> {
        self.subscription.as_ref().filter(|s| s.enabled)
    }

    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.subscription_options().is_some()
    }
}

/// A cart or order line.
///
/// Amounts are in the cart's currency unless prefixed with `base_`.
/// `qty` is the ordered quantity for order lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: String,
    pub product: Product,
    pub name: String,
    pub qty: f64,
    #[serde(default)]
    pub qty_ordered: f64,
    pub price: f64,
    pub base_price: f64,
    #[serde(default)]
    pub price_incl_tax: f64,
    #[serde(default)]
    pub base_price_incl_tax: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub base_discount_amount: f64,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub base_tax_amount: f64,
    #[serde(default)]
    pub tax_percent: f64,
    /// Shipping allocated to this line
    #[serde(default)]
    pub shipping_amount: f64,
    #[serde(default)]
    pub base_shipping_amount: f64,
    #[serde(default)]
    pub shipping_tax_amount: f64,
    #[serde(default)]
    pub base_shipping_tax_amount: f64,
    #[serde(default)]
    pub shipping_tax_percent: f64,
}

/// Discount duration attached to a cart price rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "duration")]
pub enum CouponDuration {
    Forever,
    Once,
    Repeating { months: u32 },
}

impl CouponDuration {
    /// Whether the discount stops applying at some point.
    #[must_use]
    pub fn expires(&self) -> bool {
        !matches!(self, Self::Forever)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forever => "forever",
            Self::Once => "once",
            Self::Repeating { .. } => "repeating",
        }
    }
}

/// Cart price rule applied to a cart or order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRule {
    pub rule_id: String,
    pub code: Option<String>,
    pub duration: CouponDuration,
}

/// How the order is being paid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card form embedded in the storefront checkout
    #[default]
    Embedded,
    /// Hosted Stripe Checkout page
    Checkout,
    /// Stripe invoice sent to the customer
    Invoice,
    Other(String),
}

/// Payment details stored with a cart or order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    #[serde(default)]
    pub method: PaymentMethod,
    /// Trial end imported with a migrated subscription
    #[serde(default)]
    pub subscription_start: Option<i64>,
    #[serde(default)]
    pub remove_initial_fee: bool,
    #[serde(default)]
    pub is_migrated_subscription: bool,
}

impl PaymentInfo {
    /// The migrated trial end, if present and usable.
    #[must_use]
    pub fn migrated_trial_end(&self) -> Option<i64> {
        self.subscription_start.filter(|ts| *ts >= 0)
    }
}

/// Address collected during checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub street: Vec<String>,
    pub city: String,
    pub postcode: String,
    pub country_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub telephone: Option<String>,
}

/// Shopping cart (quote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub stripe_customer_id: Option<String>,
    pub currency: String,
    pub base_currency: String,
    /// Multiplier from base currency to cart currency
    #[serde(default = "default_rate")]
    pub base_to_quote_rate: f64,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub reserved_order_id: Option<String>,
    #[serde(default)]
    pub applied_coupons: Vec<CouponRule>,
    #[serde(default)]
    pub payment: PaymentInfo,
    #[serde(default)]
    pub grand_total: f64,
}

/// Order lifecycle state as far as billing cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    #[default]
    PendingPayment,
    Processing,
    Complete,
    Canceled,
    Closed,
}

/// Placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub increment_id: String,
    pub quote_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub currency: String,
    pub base_currency: String,
    #[serde(default = "default_rate")]
    pub base_to_order_rate: f64,
    pub items: Vec<LineItem>,
    pub grand_total: f64,
    pub base_grand_total: f64,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub state: OrderState,
    #[serde(default)]
    pub applied_coupons: Vec<CouponRule>,
    #[serde(default)]
    pub payment: PaymentInfo,
}

impl Order {
    #[must_use]
    pub fn is_pending_payment(&self) -> bool {
        self.state == OrderState::PendingPayment
    }
}

fn default_rate() -> f64 {
    1.0
}

/// Where a line item is being priced from.
#[derive(Debug, Clone, Copy)]
pub enum PricingSource<'a> {
    Cart(&'a Cart),
    Order(&'a Order),
}

impl<'a> PricingSource<'a> {
    #[must_use]
    pub fn currency(&self) -> &'a str {
        match self {
            Self::Cart(c) => &c.currency,
            Self::Order(o) => &o.currency,
        }
    }

    #[must_use]
    pub fn base_currency(&self) -> &'a str {
        match self {
            Self::Cart(c) => &c.base_currency,
            Self::Order(o) => &o.base_currency,
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        match self {
            Self::Cart(c) => c.base_to_quote_rate,
            Self::Order(o) => o.base_to_order_rate,
        }
    }

    #[must_use]
    pub fn payment(&self) -> &'a PaymentInfo {
        match self {
            Self::Cart(c) => &c.payment,
            Self::Order(o) => &o.payment,
        }
    }

    #[must_use]
    pub fn coupons(&self) -> &'a [CouponRule] {
        match self {
            Self::Cart(c) => &c.applied_coupons,
            Self::Order(o) => &o.applied_coupons,
        }
    }

    #[must_use]
    pub fn items(&self) -> &'a [LineItem] {
        match self {
            Self::Cart(c) => &c.items,
            Self::Order(o) => &o.items,
        }
    }
}
