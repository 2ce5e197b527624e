//! Merging line profiles into the single schedule one Stripe subscription bills.

use super::canonical::{Interval, canonical_amount, to_minor_units};
use super::error::BillingError;
use super::profile::SubscriptionProfile;
use crate::config::TaxSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stripe limits product names; longer names are cut.
const MAX_NAME_CHARS: usize = 250;

/// The one billing schedule derived from every subscription line of a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedProfile {
    pub name: String,
    /// Sum of line totals in the cart currency
    pub amount: f64,
    /// `amount` in Stripe minor units
    pub amount_minor: i64,
    pub interval: Interval,
    pub interval_count: u32,
    pub currency: String,
    pub product_ids: Vec<String>,
}

impl CombinedProfile {
    /// Recurring cost normalized to 30 days, in minor units.
    #[must_use]
    pub fn canonical_amount(&self) -> f64 {
        canonical_amount(self.amount_minor as f64, self.interval, self.interval_count)
    }
}

/// Fold line profiles into one [`CombinedProfile`].
///
/// Lines must share currency, interval and interval count. Each line
/// contributes its total before expiring discounts.
pub fn aggregate(
    profiles: &[SubscriptionProfile],
    tax: &TaxSettings,
) -> Result<CombinedProfile, BillingError> {
    let Some(first) = profiles.first() else {
        return Err(BillingError::NoSubscriptions);
    };

    let mut amount = 0.0;
    let mut product_ids = Vec::with_capacity(profiles.len());

    for profile in profiles {
        if profile.currency != first.currency {
            return Err(BillingError::MixedCurrency {
                expected: first.currency.clone(),
                found: profile.currency.clone(),
            });
        }
        if profile.interval != first.interval || profile.interval_count != first.interval_count {
            return Err(BillingError::MustBuySeparately);
        }

        amount += profile.total_with_discount_adjustment(tax);
        product_ids.push(profile.product_id.clone());
    }

    Ok(CombinedProfile {
        name: subscriptions_name(profiles),
        amount,
        amount_minor: to_minor_units(amount, &first.currency),
        interval: first.interval,
        interval_count: first.interval_count,
        currency: first.currency.clone(),
        product_ids,
    })
}

/// Display name of the combined subscription, e.g. `"2 x Coffee, Filters"`.
#[must_use]
pub fn subscriptions_name(profiles: &[SubscriptionProfile]) -> String {
    let name = profiles
        .iter()
        .map(|p| {
            if p.qty > 1.0 {
                format!("{} x {}", p.qty, p.name)
            } else {
                p.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    name.chars().take(MAX_NAME_CHARS).collect()
}

/// Whether all lines start and renew on the same timestamps.
///
/// Starts are `now`, the migrated trial end, or `now + trial days`; ends are
/// one billing period later.
#[must_use]
pub fn renew_together(profiles: &[SubscriptionProfile], now: i64) -> bool {
    let mut starts = BTreeSet::new();
    let mut ends = BTreeSet::new();

    for profile in profiles {
        let (start, end) = profile.first_period(now);
        starts.insert(start);
        ends.insert(end);
    }

    starts.len() <= 1 && ends.len() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::cart::PricingSource;
    use crate::billing::profile::{ProfileBuilder, Trial, fixtures::*};

    fn profiles_for(prices: &[(&str, f64, Interval)]) -> Vec<SubscriptionProfile> {
        let items = prices
            .iter()
            .map(|(id, price, interval)| line(subscription_product(id, *interval), *price))
            .collect();
        let cart = cart("1", items);
        ProfileBuilder::default().profiles(PricingSource::Cart(&cart)).unwrap()
    }

    #[test]
    fn test_aggregate_sums_lines() {
        let profiles = profiles_for(&[("1", 10.0, Interval::Month), ("2", 5.5, Interval::Month)]);
        let combined = aggregate(&profiles, &TaxSettings::default()).unwrap();

        assert_eq!(combined.amount_minor, 1550);
        assert_eq!(combined.currency, "usd");
        assert_eq!(combined.product_ids, vec!["1", "2"]);
        assert_eq!(combined.name, "Plan 1, Plan 2");
    }

    #[test]
    fn test_mixed_currency_always_fails() {
        let mut profiles =
            profiles_for(&[("1", 10.0, Interval::Month), ("2", 10.0, Interval::Month)]);
        profiles[1].currency = "eur".to_string();

        let err = aggregate(&profiles, &TaxSettings::default()).unwrap_err();
        assert_eq!(
            err,
            BillingError::MixedCurrency { expected: "usd".to_string(), found: "eur".to_string() }
        );

        profiles.swap(0, 1);
        assert!(matches!(
            aggregate(&profiles, &TaxSettings::default()),
            Err(BillingError::MixedCurrency { .. })
        ));
    }

    #[test]
    fn test_interval_mismatch_must_buy_separately() {
        let profiles = profiles_for(&[("1", 10.0, Interval::Month), ("2", 100.0, Interval::Year)]);
        assert_eq!(
            aggregate(&profiles, &TaxSettings::default()).unwrap_err(),
            BillingError::MustBuySeparately
        );

        let mut profiles =

            profiles_for(&[("1", 10.0, Interval::Month), ("2", 10.0, Interval::Month)]);
        profiles[1].interval_count = 3;
        assert_eq!(
            aggregate(&profiles, &TaxSettings::default()).unwrap_err(),
            BillingError::MustBuySeparately
        );
    }

    #[test]
    fn test_empty_aggregate() {
        assert_eq!(
            aggregate(&[], &TaxSettings::default()).unwrap_err(),
            BillingError::NoSubscriptions
        );
    }

    #[test]
    fn test_name_truncation_and_quantity() {
        let mut profiles = profiles_for(&[("1", 10.0, Interval::Month)]);
        profiles[0].qty = 2.0;
        assert_eq!(subscriptions_name(&profiles), "2 x Plan 1");

        profiles[0].name = "é".repeat(400);
        let name = subscriptions_name(&profiles);
        assert_eq!(name.chars().count(), 250);
    }

    #[test]
    fn test_renew_together_with_shared_trial_end() {
        let mut profiles =
            profiles_for(&[("1", 10.0, Interval::Month), ("2", 20.0, Interval::Month)]);
        profiles[0].trial = Trial::Until(1_900_000_000);
        profiles[1].trial = Trial::Until(1_900_000_000);

        assert!(renew_together(&profiles, 1_700_000_000));
        assert!(renew_together(&profiles, 1_700_000_500));
    }

    #[test]
    fn test_renew_together_rejects_different_cadence() {
        let profiles = profiles_for(&[("1", 10.0, Interval::Month), ("2", 100.0, Interval::Year)]);
        assert!(!renew_together(&profiles, 1_700_000_000));
    }

    #[test]
    fn test_renew_together_rejects_different_trials() {
        let mut profiles =
            profiles_for(&[("1", 10.0, Interval::Month), ("2", 10.0, Interval::Month)]);
        profiles[0].trial = Trial::Days(7);
        assert!(!renew_together(&profiles, 1_700_000_000));
    }

    #[test]
    fn test_combined_canonical_amount() {
        let profiles = profiles_for(&[("1", 30.0, Interval::Month)]);
        let combined = aggregate(&profiles, &TaxSettings::default()).unwrap();
        assert!((combined.canonical_amount() - 2958.904).abs() < 0.001);
    }
}
