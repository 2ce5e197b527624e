//! Stripe objects and request bodies used at the RPC boundary.
//!
//! Responses are parsed into these types as soon as they arrive so that
//! business logic never walks untyped JSON. Only the fields this crate reads
//! are declared; everything else in the payload is ignored.

use super::canonical::Interval;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Metadata key linking a Stripe object to a local order.
pub const META_ORDER_NUMBER: &str = "Order #";
/// Metadata key set when a subscription was updated without a new order.
pub const META_ORIGINAL_ORDER_NUMBER: &str = "Original Order #";
/// Comma-separated product ids of a combined subscription.
pub const META_SUBSCRIPTION_PRODUCT_IDS: &str = "SubscriptionProductIDs";
/// Product id of subscriptions created before line items were combined.
pub const META_PRODUCT_ID: &str = "Product ID";
pub const META_TYPE: &str = "Type";
pub const SUBSCRIPTIONS_TOTAL_TYPE: &str = "SubscriptionsTotal";

/// A field Stripe returns either as an id or, when expanded, as an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Object(Box<T>),
    Id(String),
}

impl<T: HasId> Expandable<T> {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(obj) => obj.object_id(),
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => Some(obj),
            Self::Id(_) => None,
        }
    }
}

/// Stripe objects that have an id.
pub trait HasId {
    fn object_id(&self) -> &str;
}

macro_rules! impl_has_id {
    ($($ty:ty),*) => {
        $(impl HasId for $ty {
            fn object_id(&self) -> &str {
                &self.id
            }
        })*
    };
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: Interval,
    #[serde(default = "one")]
    pub interval_count: u32,
}

fn one() -> u32 {
    1
}

/// Price object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObject {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: PriceObject,
    #[serde(default = "one_u64")]
    pub quantity: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn one_u64() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

/// Subscription object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub current_period_start: i64,
    #[serde(default)]
    pub current_period_end: i64,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub default_payment_method: Option<String>,
    #[serde(default)]
    pub latest_invoice: Option<Expandable<InvoiceObject>>,
    #[serde(default)]
    pub items: List<SubscriptionItem>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// Expanded latest invoice, when the request asked for it.
    #[must_use]
    pub fn latest_invoice(&self) -> Option<&InvoiceObject> {
        self.latest_invoice.as_ref().and_then(Expandable::as_object)
    }

    #[must_use]
    pub fn latest_invoice_id(&self) -> Option<&str> {
        self.latest_invoice.as_ref().map(Expandable::id)
    }

    #[must_use]
    pub fn order_increment_id(&self) -> Option<&str> {
        self.metadata
            .get(META_ORDER_NUMBER)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Why an invoice was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    SubscriptionCreate,
    SubscriptionCycle,
    SubscriptionUpdate,
    SubscriptionThreshold,
    Manual,
    Upcoming,
    #[serde(other)]
    Other,
}

impl BillingReason {
    /// Invoices whose payment is handled by the invoice path, not charges.
    #[must_use]
    pub fn is_recurring_charge(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionCycle | Self::SubscriptionUpdate | Self::SubscriptionThreshold
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub id: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub quantity: Option<u64>,
    /// `subscription` or `invoiceitem`
    #[serde(rename = "type", default)]
    pub line_type: String,
    #[serde(default)]
    pub proration: bool,
}

impl InvoiceLine {
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        self.price.as_ref().is_some_and(|p| p.recurring.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub coupon: CouponObject,
}

/// Invoice object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable<CustomerObject>>,
    #[serde(default)]
    pub subscription: Option<Expandable<SubscriptionObject>>,
    #[serde(default)]
    pub billing_reason: Option<BillingReason>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_remaining: i64,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntentObject>>,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub lines: List<InvoiceLine>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InvoiceObject {
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(Expandable::id)
    }

    #[must_use]
    pub fn coupon_id(&self) -> Option<&str> {
        self.discount.as_ref().map(|d| d.coupon.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCouponDuration {
    Forever,
    Once,
    Repeating,
}

/// Coupon object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponObject {
    pub id: String,
    #[serde(default)]
    pub amount_off: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub duration: RemoteCouponDuration,
    #[serde(default)]
    pub duration_in_months: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Customer object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    /// Negative values are credit owed to the customer
    #[serde(default)]
    pub balance: i64,
}

/// Payment intent object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Refund object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

impl_has_id!(
    SubscriptionObject,
    InvoiceObject,
    CustomerObject,
    PaymentIntentObject,
    PriceObject,
    CouponObject
);

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringParams {
    pub interval: Interval,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductData {
    pub name: String,
}

/// Shape of a price to create.
///
/// Compared field by field against the memoized shape; any difference means
/// a new price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceShape {
    pub unit_amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recurring: Option<RecurringParams>,
    pub product_data: ProductData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItemParams {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, String>,
    pub price: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItemParams {
    pub price: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSettings {
    pub save_default_payment_method: String,
}

/// Body of `POST /v1/subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub customer: String,
    pub items: Vec<SubscriptionItemParams>,
    pub payment_behavior: String,
    pub expand: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub payment_settings: PaymentSettings,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coupon: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub add_invoice_items: Vec<InvoiceItemParams>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trial_end: Option<i64>,
}

/// Proration behavior for subscription updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    CreateProrations,
    None,
    AlwaysInvoice,
}

/// Body of `POST /v1/subscriptions/{id}`.
///
/// Unset fields are left untouched by Stripe. An empty metadata value
/// removes that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSubscriptionParams {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trial_end: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub expand: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub items: Option<Vec<SubscriptionItemParams>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proration_behavior: Option<ProrationBehavior>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proration_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_payment_method: Option<String>,
}

/// Query of `GET /v1/invoices/upcoming`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingInvoiceParams {
    pub customer: String,
    pub subscription: String,
    pub subscription_items: Vec<SubscriptionItemParams>,
    pub subscription_proration_behavior: ProrationBehavior,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subscription_proration_date: Option<i64>,
}

/// Body of `POST /v1/coupons`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCouponParams {
    pub id: String,
    pub amount_off: i64,
    pub currency: String,
    pub name: String,
    pub duration: RemoteCouponDuration,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_in_months: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_with_expanded_invoice() {
        let json = serde_json::json!({
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "latest_invoice": {
                "id": "in_1",
                "billing_reason": "subscription_create",
                "discount": {"coupon": {"id": "500USD-once", "duration": "once", "amount_off": 500}},
                "lines": {"data": [
                    {"amount": 1000, "currency": "usd", "type": "subscription",
                     "price": {"id": "price_1", "currency": "usd", "unit_amount": 1000,
                               "recurring": {"interval": "month", "interval_count": 1}}}
                ]}
            },
            "items": {"data": [{
                "id": "si_1",
                "quantity": 1,
                "price": {"id": "price_1", "currency": "usd", "unit_amount": 1000,
                          "recurring": {"interval": "month", "interval_count": 1}}
            }]},
            "metadata": {"Order #": "000000100"}
        });

        let sub: SubscriptionObject = serde_json::from_value(json).unwrap();
        assert_eq!(sub.latest_invoice_id(), Some("in_1"));
        let invoice = sub.latest_invoice().unwrap();
        assert_eq!(invoice.coupon_id(), Some("500USD-once"));
        assert!(invoice.lines.data[0].is_recurring());
        assert_eq!(sub.order_increment_id(), Some("000000100"));
    }

    #[test]
    fn test_unknown_billing_reason() {
        let invoice: InvoiceObject = serde_json::from_value(serde_json::json!({
            "id": "in_1",
            "billing_reason": "quote_accept",
            "subscription": "sub_1"
        }))
        .unwrap();
        assert_eq!(invoice.billing_reason, Some(BillingReason::Other));
        assert_eq!(invoice.subscription_id(), Some("sub_1"));
    }

    #[test]
    fn test_update_params_skip_unset_fields() {
        let params = UpdateSubscriptionParams {
            trial_end: Some(1_900_000_000),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, serde_json::json!({"trial_end": 1_900_000_000}));
    }
}
