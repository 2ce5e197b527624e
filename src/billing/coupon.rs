//! Stripe coupons for expiring cart discounts.
//!
//! A recurring price never carries a discount. When the cart discount only
//! lasts for a while, the same amount is taken off the first invoices through a
//! Stripe coupon whose id encodes amount, currency and duration, so identical
//! discounts share one coupon.

use super::cart::CouponDuration;
use super::client::StripeCouponClient;
use super::profile::SubscriptionProfile;
use super::remote::{CreateCouponParams, RemoteCouponDuration};
use crate::traits::{Cache, CacheExt};
use std::time::Duration;

/// How long a coupon seen in Stripe is trusted without asking again.
pub const DEFAULT_COUPON_TTL: Duration = Duration::from_secs(2 * 60 * 60);

fn coupon_key(coupon_id: &str) -> String {
    format!("stripe_coupon_{}", coupon_id)
}

/// The coupon a set of profiles needs.
///
/// `None` unless every profile carries an expiring coupon.
#[must_use]
pub fn coupon_params(profiles: &[SubscriptionProfile]) -> Option<CreateCouponParams> {
    let mut amount = 0;
    let mut currency = None;
    let mut duration = None;

    for profile in profiles {
        let coupon = profile.expiring_coupon.as_ref()?;
        amount += profile.discount_minor;
        currency = Some(profile.currency.clone());
        duration = Some(coupon.duration);
    }

    let currency = currency?;
    let duration = duration?;

    let mut id = format!("{}{}", amount, currency.to_ascii_uppercase());
    let (remote_duration, months) = match duration {
        CouponDuration::Once => {
            id.push_str("-once");
            (RemoteCouponDuration::Once, None)
        }
        CouponDuration::Repeating { months } => {
            id.push_str(&format!("-months-{}", months));
            (RemoteCouponDuration::Repeating, Some(months).filter(|m| *m > 0))
        }
        CouponDuration::Forever => return None,
    };

    Some(CreateCouponParams {
        id,
        amount_off: amount,
        currency,
        name: "Discount".to_string(),
        duration: remote_duration,
        duration_in_months: months,
    })
}

/// Finds or creates the coupon for a cart.
pub struct CouponResolver<C, K> {
    client: C,
    cache: K,
    ttl: Duration,
}

impl<C, K> CouponResolver<C, K>
where
    C: StripeCouponClient,
    K: Cache,
{
    pub fn new(client: C, cache: K) -> Self {
        Self {
            client,
            cache,
            ttl: DEFAULT_COUPON_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn is_known(&self, id: &str) -> bool {
        match self.cache.get::<bool>(&coupon_key(id)).await {
            Ok(known) => known.unwrap_or(false),
            Err(e) => {
                tracing::warn!(target: "subsync::reconciler", coupon_id = %id, error = %e, "Coupon cache read failed");
                false
            }
        }
    }

    async fn remember(&self, id: &str) {
        if let Err(e) = self.cache.set(&coupon_key(id), &true, Some(self.ttl)).await {
            tracing::warn!(target: "subsync::reconciler", coupon_id = %id, error = %e, "Coupon cache write failed");
        }
    }

    /// Coupon id to attach to the subscription, if any.
    ///
    /// A coupon that can neither be retrieved nor created is logged and the
    /// subscription goes ahead without it.
    pub async fn resolve(&self, profiles: &[SubscriptionProfile]) -> Option<String> {
        let params = coupon_params(profiles)?;

        if self.is_known(&params.id).await {
            return Some(params.id);
        }

        if self.client.retrieve_coupon(&params.id).await.is_ok() {
            self.remember(&params.id).await;
            return Some(params.id);
        }

        match self.client.create_coupon(&params).await {
            Ok(coupon) => {
                tracing::info!(
                    target: "subsync::reconciler",
                    coupon_id = %coupon.id,
                    amount_off = params.amount_off,
                    "Created discount coupon"
                );
                self.remember(&coupon.id).await;
                Some(coupon.id)
            }
            Err(e) => {
                tracing::error!(
                    target: "subsync::reconciler",
                    coupon_id = %params.id,
                    error = %e,
                    "Could not create discount coupon"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::canonical::Interval;
    use crate::billing::cart::{CouponRule, PricingSource};
    use crate::billing::client::test::MockStripeClient;
    use crate::billing::profile::{ProfileBuilder, fixtures::*};
    use crate::cache::InMemoryCache;

    fn discounted_profiles(duration: CouponDuration) -> Vec<SubscriptionProfile> {
        let mut item = line(subscription_product("1", Interval::Month), 20.0);
        item.discount_amount = 5.0;
        item.base_discount_amount = 5.0;
        let mut cart = cart("9", vec![item]);
        cart.applied_coupons = vec![CouponRule {
            rule_id: "3".to_string(),
            code: Some("FIVE".to_string()),
            duration,
        }];
        ProfileBuilder::default().profiles(PricingSource::Cart(&cart)).unwrap()
    }

    #[test]
    fn test_coupon_ids() {
        let once = coupon_params(&discounted_profiles(CouponDuration::Once)).unwrap();
        assert_eq!(once.id, "500USD-once");
        assert_eq!(once.duration, RemoteCouponDuration::Once);

        let months =
            coupon_params(&discounted_profiles(CouponDuration::Repeating { months: 3 })).unwrap();
        assert_eq!(months.id, "500USD-months-3");
        assert_eq!(months.duration_in_months, Some(3));

        assert!(coupon_params(&discounted_profiles(CouponDuration::Forever)).is_none());
    }

    #[test]
    fn test_no_coupon_when_one_line_has_none() {
        let mut profiles = discounted_profiles(CouponDuration::Once);
        let mut plain = profiles[0].clone();
        plain.expiring_coupon = None;
        profiles.push(plain);
        assert!(coupon_params(&profiles).is_none());
    }

    #[tokio::test]
    async fn test_resolve_creates_then_reuses() {
        let client = MockStripeClient::new();
        let resolver = CouponResolver::new(client.clone(), InMemoryCache::new(100));
        let profiles = discounted_profiles(CouponDuration::Once);

        assert_eq!(resolver.resolve(&profiles).await.as_deref(), Some("500USD-once"));
        assert_eq!(resolver.resolve(&profiles).await.as_deref(), Some("500USD-once"));
        assert_eq!(client.call_count("create_coupon"), 1);
        assert_eq!(client.call_count("retrieve_coupon"), 1);
    }

    #[tokio::test]
    async fn test_known_coupon_is_checked_again_after_ttl() {
        let client = MockStripeClient::new();
        let resolver = CouponResolver::new(client.clone(), InMemoryCache::new(100))
            .with_ttl(Duration::from_millis(50));
        let profiles = discounted_profiles(CouponDuration::Once);

        resolver.resolve(&profiles).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(resolver.resolve(&profiles).await.as_deref(), Some("500USD-once"));

        assert_eq!(client.call_count("retrieve_coupon"), 2);
        assert_eq!(client.call_count("create_coupon"), 1);
    }

    #[tokio::test]
    async fn test_create_failure_drops_coupon() {
        let client = MockStripeClient::new();
        client.fail_on("create_coupon");
        let resolver = CouponResolver::new(client, InMemoryCache::new(100));

        assert!(resolver.resolve(&discounted_profiles(CouponDuration::Once)).await.is_none());
    }
}
