//! Upgrade and downgrade decisions for plan switches.
//!
//! Amounts are compared as canonical 30-day costs so that a monthly plan can
//! be weighed against a yearly one. Whether the switch is prorated depends on
//! the store settings, the per-product overrides and on every product on both
//! sides being virtual.

use super::canonical::{Interval, canonical_amount, round_to};
use super::cart::{Cart, Product};
use super::combined::CombinedProfile;
use super::error::BillingError;
use super::orders::OrderGateway;
use super::remote::{
    META_ORDER_NUMBER, META_ORIGINAL_ORDER_NUMBER, META_PRODUCT_ID, META_SUBSCRIPTION_PRODUCT_IDS,
    SubscriptionObject, SubscriptionStatus,
};
use crate::config::SubscriptionSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Difference between two canonical amounts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub old_amount: f64,
    pub new_amount: f64,
    pub delta: f64,
}

impl PriceChange {
    /// Both amounts are rounded to 4 decimals before subtracting.
    #[must_use]
    pub fn between(old_amount: f64, new_amount: f64) -> Self {
        let old_amount = round_to(old_amount, 4);
        let new_amount = round_to(new_amount, 4);
        Self {
            old_amount,
            new_amount,
            delta: round_to(new_amount - old_amount, 4),
        }
    }

    /// A switch at the same price counts as an upgrade: the products changed
    /// and a new order tracks the change.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.delta >= 0.0
    }

    #[must_use]
    pub fn is_downgrade(&self) -> bool {
        self.delta < 0.0
    }
}

/// A remote subscription being changed, with the catalog products it bills.
#[derive(Debug, Clone)]
pub struct CurrentSubscription {
    subscription: SubscriptionObject,
    products: Vec<Product>,
}

impl CurrentSubscription {
    /// Wrap a remote subscription without loading its products.
    #[must_use]
    pub fn new(subscription: SubscriptionObject, products: Vec<Product>) -> Self {
        Self { subscription, products }
    }

    /// Wrap a remote subscription and load its products.
    ///
    /// Products that cannot be loaded are left out; every check that needs
    /// them then fails closed.
    pub async fn load<G>(subscription: SubscriptionObject, gateway: &G) -> Self
    where
        G: OrderGateway + ?Sized,
    {
        let mut products = Vec::new();
        for product_id in product_ids_of(&subscription) {
            match gateway.load_product(&product_id).await {
                Ok(Some(product)) => products.push(product),
                Ok(None) => tracing::error!(
                    target: "subsync::proration",
                    product_id = %product_id,
                    subscription_id = %subscription.id,
                    "Could not load subscription product with ID {}", product_id
                ),
                Err(e) => tracing::error!(
                    target: "subsync::proration",
                    product_id = %product_id,
                    error = %e,
                    "Could not load subscription product"
                ),
            }
        }
        Self { subscription, products }
    }

    pub fn subscription(&self) -> &SubscriptionObject {
        &self.subscription
    }

    pub fn into_subscription(self) -> SubscriptionObject {
        self.subscription
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    #[must_use]
    pub fn product_ids(&self) -> Vec<String> {
        product_ids_of(&self.subscription)
    }

    /// Order that started the subscription. After an in-place update this is
    /// the original order.
    #[must_use]
    pub fn order_increment_id(&self) -> Option<&str> {
        let metadata = &self.subscription.metadata;
        metadata
            .get(META_ORDER_NUMBER)
            .or_else(|| metadata.get(META_ORIGINAL_ORDER_NUMBER))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Canonical 30-day cost of the first subscription item.
    pub fn canonical_amount(&self) -> Result<f64, BillingError> {
        let price = self
            .subscription
            .items
            .data
            .first()
            .map(|item| &item.price)
            .ok_or_else(|| BillingError::internal("This subscription has no price data."))?;

        let (Some(amount), Some(recurring)) = (price.unit_amount, price.recurring.as_ref()) else {
            return Err(BillingError::internal("This subscription has no price data."));
        };

        Ok(canonical_amount(amount as f64, recurring.interval, recurring.interval_count))
    }

    /// Billing cadence of the first subscription item.
    #[must_use]
    pub fn cadence(&self) -> Option<(Interval, u32)> {
        let recurring = self.subscription.items.data.first()?.price.recurring.as_ref()?;
        Some((recurring.interval, recurring.interval_count))
    }

    #[must_use]
    pub fn is_products_switch(&self, new_product_ids: &[String]) -> bool {
        let old: BTreeSet<String> = self.product_ids().into_iter().collect();
        let new: BTreeSet<String> = new_product_ids.iter().cloned().collect();
        old != new
    }

    /// Subscription combining several products.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.product_ids().len() > 1
    }

    fn is_active(&self) -> bool {
        self.subscription.status == SubscriptionStatus::Active
    }

    /// Whether the customer may switch this subscription to other products.
    #[must_use]
    pub fn can_upgrade_downgrade(&self, settings: &SubscriptionSettings) -> bool {
        if !settings.enabled || !self.is_active() || self.is_composite() {
            return false;
        }
        self.products
            .iter()
            .any(|product| upgrades_allowed(product, settings))
    }

    /// Whether the customer may change the shipping address.
    #[must_use]
    pub fn can_change_shipping(&self, settings: &SubscriptionSettings) -> bool {
        if !settings.enabled || !self.is_active() {
            return false;
        }
        self.products
            .iter()
            .any(|product| product.is_subscription() && !product.is_virtual)
    }

    fn all_products_virtual(&self) -> bool {
        let expected = self.product_ids().len();
        expected > 0
            && self.products.len() == expected
            && self.products.iter().all(|p| p.is_virtual)
    }
}

fn product_ids_of(subscription: &SubscriptionObject) -> Vec<String> {
    let metadata = &subscription.metadata;
    let raw = metadata
        .get(META_PRODUCT_ID)
        .or_else(|| metadata.get(META_SUBSCRIPTION_PRODUCT_IDS));

    raw.map(|ids| {
        ids.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn upgrades_allowed(product: &Product, settings: &SubscriptionSettings) -> bool {
    product
        .subscription_options()
        .is_some_and(|options| options.upgrades_downgrades.resolve(settings.upgrades_downgrades))
}

fn prorate_upgrades(product: &Product, settings: &SubscriptionSettings) -> bool {
    upgrades_allowed(product, settings)
        && product
            .subscription_options()
            .is_some_and(|options| options.prorate_upgrades.resolve(settings.prorate_upgrades))
}

fn prorate_downgrades(product: &Product, settings: &SubscriptionSettings) -> bool {
    upgrades_allowed(product, settings)
        && product
            .subscription_options()
            .is_some_and(|options| options.prorate_downgrades.resolve(settings.prorate_downgrades))
}

/// Outcome of weighing a plan switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProrationDecision {
    pub price_change: PriceChange,
    pub use_prorations: bool,
    /// A payment is collected now, so a new order records it
    pub place_new_order: bool,
    /// The downgrade leaves a credit balance that is refunded once the
    /// update invoice exists
    pub refund_credit_balance: bool,
}

impl ProrationDecision {
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.price_change.is_upgrade()
    }
}

/// Decides whether a plan switch is prorated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProrationEngine {
    settings: SubscriptionSettings,
}

impl ProrationEngine {
    #[must_use]
    pub fn new(settings: SubscriptionSettings) -> Self {
        Self { settings }
    }

    /// Whether switching `current` to the cart should be prorated.
    #[must_use]
    pub fn use_prorations(
        &self,
        current: &CurrentSubscription,
        cart: &Cart,
        new: &CombinedProfile,
        change: &PriceChange,
    ) -> bool {
        if !self.settings.enabled {
            return false;
        }
        if !current.is_products_switch(&new.product_ids) {
            return false;
        }

        let new_products: Vec<&Product> = cart
            .items
            .iter()
            .map(|item| &item.product)
            .filter(|product| product.is_subscription())
            .collect();

        if !current.all_products_virtual() || !new_products.iter().all(|p| p.is_virtual) {
            tracing::debug!(
                target: "subsync::proration",
                subscription_id = %current.subscription().id,
                "Not a virtual to virtual product switch"
            );
            return false;
        }
        if !cart.is_virtual {
            return false;
        }

        let mut result = None;
        for product in new_products {
            let prorate = (change.is_upgrade() && prorate_upgrades(product, &self.settings))
                || (change.is_downgrade() && prorate_downgrades(product, &self.settings));

            if result.is_some_and(|previous| previous != prorate) {
                tracing::warn!(
                    target: "subsync::proration",
                    product_id = %product.id,
                    "Products in the cart have different proration settings; prorations disabled"
                );
                return false;
            }
            result = Some(prorate);
        }

        result.unwrap_or(false)
    }

    /// Weigh a switch from `current` to the cart's combined profile.
    pub fn decide(
        &self,
        current: &CurrentSubscription,
        cart: &Cart,
        new: &CombinedProfile,
    ) -> Result<ProrationDecision, BillingError> {
        let price_change =
            PriceChange::between(current.canonical_amount()?, new.canonical_amount());
        let use_prorations = self.use_prorations(current, cart, new, &price_change);

        let decision = ProrationDecision {
            price_change,
            use_prorations,
            place_new_order: use_prorations && price_change.delta > 0.0,
            refund_credit_balance: use_prorations && price_change.delta <= 0.0,
        };

        tracing::debug!(
            target: "subsync::proration",
            subscription_id = %current.subscription().id,
            delta = decision.price_change.delta,
            use_prorations = decision.use_prorations,
            place_new_order = decision.place_new_order,
            "Weighed subscription update"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cart::{ConfigOverride, PricingSource};
    use crate::billing::combined::aggregate;
    use crate::billing::orders::test::MockOrderGateway;
    use crate::billing::profile::{ProfileBuilder, fixtures::*};
    use crate::billing::remote::{List, PriceObject, Recurring, SubscriptionItem};
    use crate::config::TaxSettings;
    use std::collections::HashMap;

    fn remote_subscription(
        product_ids: &str,
        unit_amount: i64,
        interval: Interval,
    ) -> SubscriptionObject {
        SubscriptionObject {
            id: "sub_old".to_string(),
            customer: "cus_test".to_string(),
            status: SubscriptionStatus::Active,
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            trial_end: None,
            cancel_at_period_end: false,
            default_payment_method: None,
            latest_invoice: None,
            items: List {
                data: vec![SubscriptionItem {
                    id: "si_old".to_string(),
                    price: PriceObject {
                        id: "price_old".to_string(),
                        unit_amount: Some(unit_amount),
                        currency: "usd".to_string(),
                        recurring: Some(Recurring { interval, interval_count: 1 }),
                    },
                    quantity: 1,
                    metadata: HashMap::new(),
                }],
            },
            metadata: [
                ("SubscriptionProductIDs".to_string(), product_ids.to_string()),
                ("Order #".to_string(), "000000100".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn current(product_ids: &str, unit_amount: i64) -> CurrentSubscription {
        let products = product_ids
            .split(',')
            .map(|id| subscription_product(id, Interval::Month))
            .collect();
        CurrentSubscription::new(
            remote_subscription(product_ids, unit_amount, Interval::Month),
            products,
        )
    }

    fn switch_cart(product_id: &str, price: f64) -> (Cart, CombinedProfile) {
        let cart = cart("20", vec![line(subscription_product(product_id, Interval::Month), price)]);
        let profiles = ProfileBuilder::default().profiles(PricingSource::Cart(&cart)).unwrap();
        let combined = aggregate(&profiles, &TaxSettings::default()).unwrap();
        (cart, combined)
    }

    #[test]
    fn test_price_change_classification() {
        let up = PriceChange::between(1000.0, 1200.0);
        assert!(up.is_upgrade());
        assert_eq!(up.delta, 200.0);

        let down = PriceChange::between(1000.0, 800.0);
        assert!(down.is_downgrade());
        assert_eq!(down.delta, -200.0);

        let same = PriceChange::between(1000.0, 1000.0);
        assert!(same.is_upgrade());
        assert!(!same.is_downgrade());
        assert_eq!(same.delta, 0.0);
    }

    #[test]
    fn test_upgrade_places_new_order() {
        let engine = ProrationEngine::default();
        let (cart, combined) = switch_cart("11", 20.0);

        let decision = engine.decide(&current("10", 1000), &cart, &combined).unwrap();
        assert!(decision.use_prorations);
        assert!(decision.is_upgrade());
        assert!(decision.place_new_order);
        assert!(!decision.refund_credit_balance);
    }

    #[test]
    fn test_downgrade_refunds_credit() {
        let engine = ProrationEngine::default();
        let (cart, combined) = switch_cart("11", 10.0);

        let decision = engine.decide(&current("10", 2000), &cart, &combined).unwrap();
        assert!(decision.use_prorations);
        assert!(!decision.place_new_order);
        assert!(decision.refund_credit_balance);
    }

    #[test]
    fn test_same_products_never_prorate() {
        let engine = ProrationEngine::default();
        let (cart, combined) = switch_cart("10", 20.0);

        let decision = engine.decide(&current("10", 1000), &cart, &combined).unwrap();
        assert!(!decision.use_prorations);
        assert!(!decision.place_new_order);
    }

    #[test]
    fn test_physical_products_never_prorate() {
        let engine = ProrationEngine::default();
        let (mut cart, combined) = switch_cart("11", 20.0);
        cart.items[0].product.is_virtual = false;
        assert!(!engine.decide(&current("10", 1000), &cart, &combined).unwrap().use_prorations);

        let (mut cart, combined) = switch_cart("11", 20.0);
        cart.is_virtual = false;
        assert!(!engine.decide(&current("10", 1000), &cart, &combined).unwrap().use_prorations);

        let (cart, combined) = switch_cart("11", 20.0);
        let mut old = current("10", 1000);
        old.products[0].is_virtual = false;
        assert!(!engine.decide(&old, &cart, &combined).unwrap().use_prorations);
    }

    #[test]
    fn test_product_overrides() {
        let engine = ProrationEngine::default();
        let (mut cart, combined) = switch_cart("11", 20.0);
        let options = cart.items[0].product.subscription.as_mut().unwrap();
        options.prorate_upgrades = ConfigOverride::Disabled;
        assert!(!engine.decide(&current("10", 1000), &cart, &combined).unwrap().use_prorations);

        let engine = ProrationEngine::new(SubscriptionSettings {
            prorate_upgrades: false,
            ..Default::default()
        });
        let (mut cart, combined) = switch_cart("11", 20.0);
        let options = cart.items[0].product.subscription.as_mut().unwrap();
        options.prorate_upgrades = ConfigOverride::Enabled;
        assert!(engine.decide(&current("10", 1000), &cart, &combined).unwrap().use_prorations);

        let (mut cart, combined) = switch_cart("11", 20.0);
        let options = cart.items[0].product.subscription.as_mut().unwrap();
        options.upgrades_downgrades = ConfigOverride::Disabled;
        let decision = ProrationEngine::default()
            .decide(&current("10", 1000), &cart, &combined)
            .unwrap();
        assert!(!decision.use_prorations);
    }

    #[test]
    fn test_conflicting_product_settings_disable_prorations() {
        let mut a = subscription_product("11", Interval::Month);
        a.subscription.as_mut().unwrap().prorate_upgrades = ConfigOverride::Enabled;
        let mut b = subscription_product("12", Interval::Month);
        b.subscription.as_mut().unwrap().prorate_upgrades = ConfigOverride::Disabled;
        let cart = cart("20", vec![line(a, 10.0), line(b, 10.0)]);
        let profiles = ProfileBuilder::default().profiles(PricingSource::Cart(&cart)).unwrap();
        let combined = aggregate(&profiles, &TaxSettings::default()).unwrap();

        let decision = ProrationEngine::default()
            .decide(&current("10", 1000), &cart, &combined)
            .unwrap();
        assert!(!decision.use_prorations);
    }

    #[test]
    fn test_cross_cadence_comparison() {
        let yearly = CurrentSubscription::new(
            remote_subscription("10", 120_000, Interval::Year),
            vec![subscription_product("10", Interval::Year)],
        );

        // 1200.00 a year costs the same per 30 days as 100.00 a month
        let (cart, combined) = switch_cart("11", 100.0);
        let decision = ProrationEngine::default().decide(&yearly, &cart, &combined).unwrap();
        assert_eq!(decision.price_change.delta, 0.0);

        let (cart, combined) = switch_cart("11", 90.0);
        let decision = ProrationEngine::default().decide(&yearly, &cart, &combined).unwrap();
        assert!(decision.price_change.is_downgrade());
    }

    #[test]
    fn test_missing_price_data() {
        let mut sub = current("10", 1000);
        sub.subscription.items.data.clear();
        assert_eq!(
            sub.canonical_amount().unwrap_err(),
            BillingError::internal("This subscription has no price data.")
        );
    }

    #[test]
    fn test_subscription_helpers() {
        let settings = SubscriptionSettings::default();
        let sub = current("10", 1000);
        assert_eq!(sub.product_ids(), vec!["10"]);
        assert_eq!(sub.order_increment_id(), Some("000000100"));
        assert!(!sub.is_composite());
        assert!(sub.can_upgrade_downgrade(&settings));
        assert!(!sub.can_change_shipping(&settings));
        assert_eq!(sub.cadence(), Some((Interval::Month, 1)));

        let composite = current("10,11", 1000);
        assert!(composite.is_composite());
        assert!(!composite.can_upgrade_downgrade(&settings));
        assert!(!composite.is_products_switch(&["11".to_string(), "10".to_string()]));

        let mut legacy = remote_subscription("", 1000, Interval::Month);
        legacy.metadata.insert("Product ID".to_string(), "7".to_string());
        let legacy = CurrentSubscription::new(legacy, Vec::new());
        assert_eq!(legacy.product_ids(), vec!["7"]);
        assert!(!legacy.can_upgrade_downgrade(&settings));
    }

    #[tokio::test]
    async fn test_load_skips_missing_products() {
        let gateway = MockOrderGateway::new();
        gateway.add_product(subscription_product("10", Interval::Month));

        let remote = remote_subscription("10,99", 1000, Interval::Month);
        let loaded = CurrentSubscription::load(remote, &gateway).await;
        assert_eq!(loaded.products().len(), 1);
        assert!(!loaded.all_products_virtual());
    }
}
