//! Per-line subscription billing profiles.
//!
//! A profile is recomputed from a cart or order line every time it is needed
//! and never persisted. It holds the amounts in the cart currency, the base
//! currency and Stripe minor units side by side, because totals shown to the
//! customer and amounts sent to Stripe are rounded differently.

use super::canonical::{Interval, add_intervals, round_to, to_minor_units};
use super::cart::{CouponRule, LineItem, PricingSource};
use super::error::BillingError;
use crate::config::TaxSettings;
use serde::{Deserialize, Serialize};

/// When billing starts for a profile.
///
/// A migrated subscription carries an absolute trial end which always wins
/// over the product's trial length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Trial {
    #[default]
    None,
    Days(u32),
    Until(i64),
}

impl Trial {
    #[must_use]
    pub fn trial_end(&self) -> Option<i64> {
        match self {
            Self::Until(ts) => Some(*ts),
            _ => None,
        }
    }

    #[must_use]
    pub fn trial_days(&self) -> u32 {
        match self {
            Self::Days(days) => *days,
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_trialing(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// First billing timestamp relative to `now`.
    #[must_use]
    pub fn billing_start(&self, now: i64) -> i64 {
        match self {
            Self::None => now,
            Self::Days(days) => now + i64::from(*days) * 86_400,
            Self::Until(ts) => *ts,
        }
    }
}

/// Billing facts for one subscription line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionProfile {
    pub product_id: String,
    pub name: String,
    pub qty: f64,
    pub interval: Interval,
    pub interval_count: u32,
    /// Lowercase ISO code
    pub currency: String,
    pub base_currency: String,

    pub amount: f64,
    pub base_amount: f64,
    pub amount_minor: i64,

    pub discount_amount: f64,
    pub base_discount_amount: f64,
    pub discount_minor: i64,

    pub shipping_amount: f64,
    pub base_shipping_amount: f64,
    pub shipping_minor: i64,

    pub tax_percent: f64,
    pub shipping_tax_percent: f64,
    /// Item tax, already multiplied by quantity
    pub tax_amount_item: f64,
    pub base_tax_amount_item: f64,
    pub tax_item_minor: i64,
    pub tax_amount_shipping: f64,
    pub base_tax_amount_shipping: f64,
    pub tax_shipping_minor: i64,

    pub initial_fee: f64,
    pub initial_fee_minor: i64,
    pub tax_amount_initial_fee: f64,
    pub tax_initial_fee_minor: i64,

    pub trial: Trial,

    /// Coupon whose discount stops applying after a while
    pub expiring_coupon: Option<CouponRule>,
    pub expiring_tax_amount_item: f64,
    pub expiring_base_tax_amount_item: f64,
    pub expiring_discount_amount: f64,
    pub expiring_base_discount_amount: f64,
}

impl SubscriptionProfile {
    /// Recurring total in the cart currency, rounded to cents.
    #[must_use]
    pub fn total(&self, tax: &TaxSettings) -> f64 {
        let mut total = self.qty * self.amount + self.shipping_amount - self.discount_amount;

        if !tax.shipping_includes_tax {
            total += self.tax_amount_shipping;
        }
        if !tax.price_includes_tax {
            total += self.tax_amount_item;
        }

        round_to(total, 2)
    }

    /// Recurring total before an expiring discount is taken off.
    ///
    /// The recurring price is created at the undiscounted amount; the
    /// coupon brings the first invoices back down.
    #[must_use]
    pub fn total_with_discount_adjustment(&self, tax: &TaxSettings) -> f64 {
        let total = self.total(tax);
        if self.expiring_coupon.is_some() {
            total + self.discount_amount
        } else {
            total
        }
    }

    /// Billing start and end of the first period.
    #[must_use]
    pub fn first_period(&self, now: i64) -> (i64, i64) {
        let start = self.trial.billing_start(now);
        (start, add_intervals(start, self.interval, self.interval_count))
    }
}

/// Raise the initial charge by expiring discounts when every line is on trial.
///
/// With a trial the coupon applies to the first real invoice, so the amount
/// paid today must not be reduced by it.
#[must_use]
pub fn stripe_discount_adjustment(profiles: &[SubscriptionProfile]) -> i64 {
    let mut adjustment = 0;
    for profile in profiles {
        if profile.trial.trial_days() == 0 {
            return 0;
        }
        if profile.expiring_coupon.is_some() {
            adjustment += profile.discount_minor;
        }
    }
    adjustment
}

/// The single expiring coupon applied to a cart, if any.
pub fn expiring_coupon(coupons: &[CouponRule]) -> Option<CouponRule> {
    match coupons {
        [] => None,
        [coupon] => coupon.duration.expires().then(|| coupon.clone()),
        _ => {
            tracing::error!(
                target: "subsync::profile",
                rules = coupons.len(),
                "Could not apply discount coupon: Multiple cart price rules were applied on the cart. Only one can be applied on subscription carts."
            );
            None
        }
    }
}

fn tax_inclusive(amount: f64, percent: f64) -> f64 {
    if percent <= 0.0 {
        return 0.0;
    }
    round_to(amount * percent / (100.0 + percent), 4)
}

fn tax_exclusive(amount: f64, percent: f64) -> f64 {
    if percent <= 0.0 {
        return 0.0;
    }
    round_to(amount * percent / 100.0, 4)
}

/// Builds [`SubscriptionProfile`]s from cart and order lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileBuilder {
    tax: TaxSettings,
}

impl ProfileBuilder {
    #[must_use]
    pub fn new(tax: TaxSettings) -> Self {
        Self { tax }
    }

    #[must_use]
    pub fn tax_settings(&self) -> &TaxSettings {
        &self.tax
    }

    /// Profiles for every subscription line of a cart or order.
    ///
    /// Lines that are not subscription products are skipped; a subscription
    /// product with broken settings is an error.
    pub fn profiles(
        &self,
        source: PricingSource<'_>,
    ) -> Result<Vec<SubscriptionProfile>, BillingError> {
        source
            .items()
            .iter()
            .filter(|item| item.product.is_subscription())
            .map(|item| self.build(item, source))
            .collect()
    }

    /// Build the profile of a single line.
    pub fn build(
        &self,
        item: &LineItem,
        source: PricingSource<'_>,
    ) -> Result<SubscriptionProfile, BillingError> {
        let product = &item.product;
        let options = product.subscription_options().ok_or_else(|| {
            BillingError::NotASubscriptionProduct {
                product_id: product.id.clone(),
                reason: "subscriptions are not enabled for this product".to_string(),
            }
        })?;

        let interval = options.interval.ok_or_else(|| BillingError::NotASubscriptionProduct {
            product_id: product.id.clone(),
            reason: "An interval period has not been specified for the subscription".to_string(),
        })?;

        let interval_count = match options.interval_count {
            None => 1,
            Some(0) => {
                return Err(BillingError::NotASubscriptionProduct {
                    product_id: product.id.clone(),
                    reason: "The interval count must be positive".to_string(),
                });
            }
            Some(n) => n,
        };

        let currency = source.currency().to_ascii_lowercase();
        let base_currency = source.base_currency().to_ascii_lowercase();
        let rate = source.rate();
        let payment = source.payment();
        let qty = item.qty.max(item.qty_ordered);

        let (mut amount, base_amount) = if self.tax.price_includes_tax {
            (item.price_incl_tax, item.base_price_incl_tax)
        } else {
            (item.price, item.base_price)
        };

        // The storefront sometimes reports the base price as the converted
        // price; convert it ourselves when that happens.
        if rate > 0.0 && rate != 1.0 && amount == item.base_price {
            amount = round_to(amount * rate, 2);
        }

        let mut initial_fee = options.initial_fee;
        if rate > 0.0 {
            initial_fee = round_to(initial_fee * rate, 2);
        }
        if payment.remove_initial_fee {
            initial_fee = 0.0;
        }

        let tax_amount_initial_fee = if self.tax.price_includes_tax {
            tax_inclusive(initial_fee * qty, item.tax_percent)
        } else {
            tax_exclusive(initial_fee * qty, item.tax_percent)
        };

        let shipping_amount = round_to(item.shipping_amount, 2);
        let tax_amount_shipping = round_to(item.shipping_tax_amount, 4);

        let mut profile = SubscriptionProfile {
            product_id: product.id.clone(),
            name: item.name.clone(),
            qty,
            interval,
            interval_count,
            amount,
            base_amount,
            amount_minor: to_minor_units(amount, &currency),
            discount_amount: item.discount_amount,
            base_discount_amount: item.base_discount_amount,
            discount_minor: to_minor_units(item.discount_amount, &currency),
            shipping_amount,
            base_shipping_amount: round_to(item.base_shipping_amount, 2),
            shipping_minor: to_minor_units(shipping_amount, &currency),
            tax_percent: item.tax_percent,
            shipping_tax_percent: item.shipping_tax_percent,
            tax_amount_item: item.tax_amount,
            base_tax_amount_item: item.base_tax_amount,
            tax_item_minor: to_minor_units(item.tax_amount, &currency),
            tax_amount_shipping,
            base_tax_amount_shipping: round_to(item.base_shipping_tax_amount, 2),
            tax_shipping_minor: to_minor_units(tax_amount_shipping, &currency),
            initial_fee: 0.0,
            initial_fee_minor: 0,
            tax_amount_initial_fee,
            tax_initial_fee_minor: to_minor_units(tax_amount_initial_fee, &currency),
            trial: Trial::None,
            expiring_coupon: None,
            expiring_tax_amount_item: 0.0,
            expiring_base_tax_amount_item: 0.0,
            expiring_discount_amount: 0.0,
            expiring_base_discount_amount: 0.0,
            currency,
            base_currency,
        };

        if let Some(trial_end) = payment.migrated_trial_end() {
            profile.trial = Trial::Until(trial_end);
        } else {
            if let Some(days) = options.trial_days.filter(|d| *d > 0) {
                profile.trial = Trial::Days(days);
            }
            if item.discount_amount > 0.0 {
                profile.expiring_coupon = expiring_coupon(source.coupons());
            }
            profile.initial_fee = initial_fee;
            profile.initial_fee_minor = to_minor_units(initial_fee, &profile.currency);
        }

        if profile.expiring_coupon.is_some() {
            apply_expiring_discount(&mut profile);
        }

        Ok(profile)
    }
}

/// Charge tax on the undiscounted amount and grow the discount by the same
/// delta, so that the displayed totals stay unchanged while the coupon lasts.
fn apply_expiring_discount(profile: &mut SubscriptionProfile) {
    let full_tax = round_to(profile.amount * profile.qty * (profile.tax_percent / 100.0), 4);
    let full_base_tax =
        round_to(profile.base_amount * profile.qty * (profile.tax_percent / 100.0), 4);
    let full_tax_minor = to_minor_units(full_tax, &profile.currency);

    let diff = full_tax - profile.tax_amount_item;
    let base_diff = full_base_tax - profile.base_tax_amount_item;
    let diff_minor = full_tax_minor - profile.tax_item_minor;

    profile.tax_amount_item += diff;
    profile.base_tax_amount_item += base_diff;
    profile.tax_item_minor += diff_minor;

    profile.discount_amount += diff;
    profile.base_discount_amount += base_diff;
    profile.discount_minor += diff_minor;

    profile.expiring_tax_amount_item = diff;
    profile.expiring_base_tax_amount_item = base_diff;
    profile.expiring_discount_amount = diff;
    profile.expiring_base_discount_amount = base_diff;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::super::cart::{Cart, LineItem, PaymentInfo, Product, SubscriptionOptions};
    use super::super::canonical::Interval;

    pub fn subscription_product(id: &str, amount_interval: Interval) -> Product {
        Product {
            id: id.to_string(),
            name: format!("Plan {}", id),
            is_virtual: true,
            subscription: Some(SubscriptionOptions {
                enabled: true,
                interval: Some(amount_interval),
                interval_count: Some(1),
                ..Default::default()
            }),
        }
    }

    pub fn line(product: Product, price: f64) -> LineItem {
        LineItem {
            item_id: format!("item-{}", product.id),
            name: product.name.clone(),
            product,
            qty: 1.0,
            qty_ordered: 0.0,
            price,
            base_price: price,
            price_incl_tax: price,
            base_price_incl_tax: price,
            discount_amount: 0.0,
            base_discount_amount: 0.0,
            tax_amount: 0.0,
            base_tax_amount: 0.0,
            tax_percent: 0.0,
            shipping_amount: 0.0,
            base_shipping_amount: 0.0,
            shipping_tax_amount: 0.0,
            base_shipping_tax_amount: 0.0,
            shipping_tax_percent: 0.0,
        }
    }

    pub fn cart(id: &str, items: Vec<LineItem>) -> Cart {
        Cart {
            id: id.to_string(),
            customer_id: Some("42".to_string()),
            stripe_customer_id: Some("cus_test".to_string()),
            currency: "USD".to_string(),
            base_currency: "USD".to_string(),
            base_to_quote_rate: 1.0,
            is_virtual: true,
            items,
            reserved_order_id: Some("000000100".to_string()),
            applied_coupons: Vec::new(),
            payment: PaymentInfo::default(),
            grand_total: 0.0,
        }
    }
}
