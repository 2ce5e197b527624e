//! Stripe client traits.
//!
//! Each trait covers one Stripe resource. Services take only the traits they
//! need; [`FullStripeClient`] is the convenience bound for components that
//! touch everything.

use super::remote::{
    CouponObject, CreateCouponParams, CustomerObject, InvoiceObject, PriceObject, PriceShape,
    RefundObject, SubscriptionObject, SubscriptionParams, UpcomingInvoiceParams,
    UpdateSubscriptionParams,
};
use crate::error::Result;
use async_trait::async_trait;

/// Subscription operations.
#[async_trait]
pub trait StripeSubscriptionClient: Send + Sync {
    /// Create a subscription.
    async fn create_subscription(&self, params: &SubscriptionParams) -> Result<SubscriptionObject>;

    /// Retrieve a subscription, expanding the given paths.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        expand: &[&str],
    ) -> Result<SubscriptionObject>;

    /// Update a subscription.
    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
    ) -> Result<SubscriptionObject>;

    /// Cancel a subscription immediately.
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionObject>;
}

/// Price operations.
#[async_trait]
pub trait StripePriceClient: Send + Sync {
    async fn create_price(&self, shape: &PriceShape) -> Result<PriceObject>;

    async fn retrieve_price(&self, price_id: &str) -> Result<PriceObject>;
}

/// Invoice operations.
#[async_trait]
pub trait StripeInvoiceClient: Send + Sync {
    async fn retrieve_invoice(&self, invoice_id: &str, expand: &[&str]) -> Result<InvoiceObject>;

    /// Preview the next invoice as if the subscription were changed.
    async fn upcoming_invoice(&self, params: &UpcomingInvoiceParams) -> Result<InvoiceObject>;
}

/// Coupon operations.
#[async_trait]
pub trait StripeCouponClient: Send + Sync {
    async fn retrieve_coupon(&self, coupon_id: &str) -> Result<CouponObject>;

    async fn create_coupon(&self, params: &CreateCouponParams) -> Result<CouponObject>;
}

/// Customer balance and refund operations.
#[async_trait]
pub trait StripeCustomerClient: Send + Sync {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerObject>;

    /// Overwrite the customer's credit balance.
    async fn update_customer_balance(
        &self,
        customer_id: &str,
        balance: i64,
    ) -> Result<CustomerObject>;

    /// Refund part of a payment intent.
    async fn create_refund(&self, payment_intent_id: &str, amount: i64) -> Result<RefundObject>;
}

/// A type that implements all Stripe client traits.
pub trait FullStripeClient:
    StripeSubscriptionClient
    + StripePriceClient
    + StripeInvoiceClient
    + StripeCouponClient
    + StripeCustomerClient
{
}

impl<T> FullStripeClient for T where
    T: StripeSubscriptionClient
        + StripePriceClient
        + StripeInvoiceClient
        + StripeCouponClient
        + StripeCustomerClient
{
}

/// Error returned by mocks for unknown ids, shaped like Stripe's 404.
#[cfg(any(test, feature = "test-billing"))]
fn resource_missing(operation: &str, kind: &str, id: &str) -> crate::error::SubsyncError {
    super::BillingError::StripeApiError {
        operation: operation.to_string(),
        message: format!("No such {}: '{}'", kind, id),
        code: Some("resource_missing".to_string()),
        http_status: Some(404),
    }
    .into()
}

/// In-memory Stripe double.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::remote::{
        Discount, Expandable, InvoiceLine, List, ProrationBehavior, Recurring, SubscriptionItem,
        SubscriptionStatus,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock Stripe account.
    ///
    /// Created subscriptions get an expanded latest invoice that mirrors the
    /// request: recurring lines for items, one-off lines for
    /// `add_invoice_items` and the requested coupon as discount.
    #[derive(Clone, Default)]
    pub struct MockStripeClient {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        counter: AtomicU64,
        subscriptions: RwLock<HashMap<String, SubscriptionObject>>,
        prices: RwLock<HashMap<String, PriceObject>>,
        coupons: RwLock<HashMap<String, CouponObject>>,
        invoices: RwLock<HashMap<String, InvoiceObject>>,
        customers: RwLock<HashMap<String, CustomerObject>>,
        refunds: RwLock<Vec<RefundObject>>,
        upcoming: RwLock<Option<InvoiceObject>>,
        updates: RwLock<Vec<(String, UpdateSubscriptionParams)>>,
        calls: RwLock<Vec<String>>,
        failing: RwLock<HashSet<String>>,
    }

    impl MockStripeClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn next_id(&self, prefix: &str) -> String {
            let n = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{}_mock_{}", prefix, n)
        }

        fn record(&self, call: impl Into<String>) {
            self.inner.calls.write().unwrap().push(call.into());
        }

        fn check_failure(&self, operation: &str) -> Result<()> {
            if self.inner.failing.read().unwrap().contains(operation) {
                return Err(super::super::BillingError::StripeApiError {
                    operation: operation.to_string(),
                    message: "Simulated failure".to_string(),
                    code: None,
                    http_status: Some(500),
                }
                .into());
            }
            Ok(())
        }

        /// Make every call to `operation` fail with a 500.
        pub fn fail_on(&self, operation: &str) {
            self.inner.failing.write().unwrap().insert(operation.to_string());
        }

        /// Operations called so far, as `operation:id`.
        pub fn calls(&self) -> Vec<String> {
            self.inner.calls.read().unwrap().clone()
        }

        /// Number of calls to an operation.
        pub fn call_count(&self, operation: &str) -> usize {
            let prefix = format!("{}:", operation);
            self.inner
                .calls
                .read()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(&prefix))
                .count()
        }

        /// Update requests received, in order.
        pub fn updates(&self) -> Vec<(String, UpdateSubscriptionParams)> {
            self.inner.updates.read().unwrap().clone()
        }

        pub fn refunds(&self) -> Vec<RefundObject> {
            self.inner.refunds.read().unwrap().clone()
        }

        pub fn subscription(&self, id: &str) -> Option<SubscriptionObject> {
            self.inner.subscriptions.read().unwrap().get(id).cloned()
        }

        pub fn subscriptions(&self) -> Vec<SubscriptionObject> {
            self.inner.subscriptions.read().unwrap().values().cloned().collect()
        }

        pub fn prices(&self) -> Vec<PriceObject> {
            self.inner.prices.read().unwrap().values().cloned().collect()
        }

        pub fn add_subscription(&self, subscription: SubscriptionObject) {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(subscription.id.clone(), subscription);
        }

        pub fn add_price(&self, price: PriceObject) {
            self.inner.prices.write().unwrap().insert(price.id.clone(), price);
        }

        pub fn add_coupon(&self, coupon: CouponObject) {
            self.inner.coupons.write().unwrap().insert(coupon.id.clone(), coupon);
        }

        pub fn add_invoice(&self, invoice: InvoiceObject) {
            self.inner.invoices.write().unwrap().insert(invoice.id.clone(), invoice);
        }

        pub fn add_customer(&self, customer: CustomerObject) {
            self.inner.customers.write().unwrap().insert(customer.id.clone(), customer);
        }

        pub fn customer(&self, id: &str) -> Option<CustomerObject> {
            self.inner.customers.read().unwrap().get(id).cloned()
        }

        /// Invoice returned by the next upcoming-invoice preview.
        pub fn set_upcoming_invoice(&self, invoice: InvoiceObject) {
            *self.inner.upcoming.write().unwrap() = Some(invoice);
        }

        fn price_or_placeholder(&self, price_id: &str) -> PriceObject {
            self.inner
                .prices
                .read()
                .unwrap()
                .get(price_id)
                .cloned()
                .unwrap_or_else(|| PriceObject {
                    id: price_id.to_string(),
                    unit_amount: None,
                    currency: "usd".to_string(),
                    recurring: None,
                })
        }

        fn invoice_for(
            &self,
            subscription: &SubscriptionObject,
            one_off: &[(String, u64)],
            coupon: Option<&str>,
            billing_reason: super::super::remote::BillingReason,
        ) -> InvoiceObject {
            let mut lines: Vec<InvoiceLine> = subscription
                .items
                .data
                .iter()
                .map(|item| InvoiceLine {
                    id: Some(self.next_id("il")),
                    amount: item.price.unit_amount.unwrap_or(0) * item.quantity as i64,
                    currency: item.price.currency.clone(),
                    description: None,
                    price: Some(item.price.clone()),
                    quantity: Some(item.quantity),
                    line_type: "subscription".to_string(),
                    proration: false,
                })
                .collect();

            for (price_id, quantity) in one_off {
                let price = self.price_or_placeholder(price_id);
                lines.push(InvoiceLine {
                    id: Some(self.next_id("il")),
                    amount: price.unit_amount.unwrap_or(0) * *quantity as i64,
                    currency: price.currency.clone(),
                    description: None,
                    price: Some(price),
                    quantity: Some(*quantity),
                    line_type: "invoiceitem".to_string(),
                    proration: false,
                });
            }

            let discount = coupon.and_then(|id| {
                self.inner
                    .coupons
                    .read()
                    .unwrap()
                    .get(id)
                    .cloned()
                    .map(|coupon| Discount { coupon })
            });
            let total: i64 = lines.iter().map(|l| l.amount).sum();

            let invoice = InvoiceObject {
                id: self.next_id("in"),
                customer: Some(Expandable::Id(subscription.customer.clone())),
                subscription: Some(Expandable::Id(subscription.id.clone())),
                billing_reason: Some(billing_reason),
                status: Some("open".to_string()),
                currency: lines.first().map(|l| l.currency.clone()).unwrap_or_default(),
                total,
                amount_paid: 0,
                amount_remaining: total,
                payment_intent: None,
                discount,
                lines: List { data: lines },
                metadata: HashMap::new(),
            };
            self.add_invoice(invoice.clone());
            invoice
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[async_trait]
    impl StripeSubscriptionClient for MockStripeClient {
        async fn create_subscription(
            &self,
            params: &SubscriptionParams,
        ) -> Result<SubscriptionObject> {
            self.check_failure("create_subscription")?;
            let id = self.next_id("sub");
            self.record(format!("create_subscription:{}", id));

            let items = params
                .items
                .iter()
                .map(|item| SubscriptionItem {
                    id: self.next_id("si"),
                    price: self.price_or_placeholder(&item.price),
                    quantity: item.quantity,
                    metadata: item.metadata.clone().into_iter().collect(),
                })
                .collect();

            let start = now();
            let mut subscription = SubscriptionObject {
                id: id.clone(),
                customer: params.customer.clone(),
                status: if params.trial_end.is_some() {
                    SubscriptionStatus::Trialing
                } else {
                    SubscriptionStatus::Incomplete
                },
                current_period_start: start,
                current_period_end: start + 30 * 86_400,
                trial_end: params.trial_end,
                cancel_at_period_end: false,
                default_payment_method: None,
                latest_invoice: None,
                items: List { data: items },
                metadata: params.metadata.clone().into_iter().collect(),
            };

            let one_off: Vec<(String, u64)> = params
                .add_invoice_items
                .iter()
                .map(|i| (i.price.clone(), i.quantity))
                .collect();
            let invoice = self.invoice_for(
                &subscription,
                &one_off,
                params.coupon.as_deref(),
                super::super::remote::BillingReason::SubscriptionCreate,
            );
            subscription.latest_invoice = Some(Expandable::Object(Box::new(invoice)));

            self.add_subscription(subscription.clone());
            Ok(subscription)
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
            _expand: &[&str],
        ) -> Result<SubscriptionObject> {
            self.check_failure("retrieve_subscription")?;
            self.record(format!("retrieve_subscription:{}", subscription_id));
            self.subscription(subscription_id).ok_or_else(|| {
                resource_missing("retrieve_subscription", "subscription", subscription_id)
            })
        }

        async fn update_subscription(
            &self,
            subscription_id: &str,
            params: &UpdateSubscriptionParams,
        ) -> Result<SubscriptionObject> {
            self.check_failure("update_subscription")?;
            self.record(format!("update_subscription:{}", subscription_id));
            self.inner
                .updates
                .write()
                .unwrap()
                .push((subscription_id.to_string(), params.clone()));

            let mut subscription = self
                .subscription(subscription_id)
                .ok_or_else(|| {
                    resource_missing("update_subscription", "subscription", subscription_id)
                })?;

            if let Some(metadata) = &params.metadata {
                for (key, value) in metadata {
                    if value.is_empty() {
                        subscription.metadata.remove(key);
                    } else {
                        subscription.metadata.insert(key.clone(), value.clone());
                    }
                }
            }
            if let Some(trial_end) = params.trial_end {
                subscription.trial_end = Some(trial_end);
            }
            if let Some(cancel) = params.cancel_at_period_end {
                subscription.cancel_at_period_end = cancel;
            }
            if let Some(pm) = &params.default_payment_method {
                subscription.default_payment_method = Some(pm.clone());
            }
            if let Some(items) = &params.items {
                for change in items {
                    let price = self.price_or_placeholder(&change.price);
                    match subscription
                        .items
                        .data
                        .iter_mut()
                        .find(|i| Some(&i.id) == change.id.as_ref())
                    {
                        Some(existing) => {
                            existing.price = price;
                            existing.quantity = change.quantity;
                        }
                        None => subscription.items.data.push(SubscriptionItem {
                            id: self.next_id("si"),
                            price,
                            quantity: change.quantity,
                            metadata: change.metadata.clone().into_iter().collect(),
                        }),
                    }
                }
            }
            if params.proration_behavior == Some(ProrationBehavior::AlwaysInvoice) {
                let invoice = self.invoice_for(
                    &subscription,
                    &[],
                    None,
                    super::super::remote::BillingReason::SubscriptionUpdate,
                );
                subscription.latest_invoice = Some(Expandable::Object(Box::new(invoice)));
            }

            self.add_subscription(subscription.clone());
            Ok(subscription)
        }

        async fn cancel_subscription(&self, subscription_id: &str) -> Result<SubscriptionObject> {
            self.check_failure("cancel_subscription")?;
            self.record(format!("cancel_subscription:{}", subscription_id));
            let mut subscription = self
                .subscription(subscription_id)
                .ok_or_else(|| {
                    resource_missing("cancel_subscription", "subscription", subscription_id)
                })?;
            subscription.status = SubscriptionStatus::Canceled;
            self.add_subscription(subscription.clone());
            Ok(subscription)
        }
    }

    #[async_trait]
    impl StripePriceClient for MockStripeClient {
        async fn create_price(&self, shape: &PriceShape) -> Result<PriceObject> {
            self.check_failure("create_price")?;
            let id = self.next_id("price");
            self.record(format!("create_price:{}", id));
            let price = PriceObject {
                id,
                unit_amount: Some(shape.unit_amount),
                currency: shape.currency.clone(),
                recurring: shape.recurring.as_ref().map(|r| Recurring {
                    interval: r.interval,
                    interval_count: r.interval_count,
                }),
            };
            self.add_price(price.clone());
            Ok(price)
        }

        async fn retrieve_price(&self, price_id: &str) -> Result<PriceObject> {
            self.check_failure("retrieve_price")?;
            self.record(format!("retrieve_price:{}", price_id));
            self.inner
                .prices
                .read()
                .unwrap()
                .get(price_id)
                .cloned()
                .ok_or_else(|| resource_missing("retrieve_price", "price", price_id))
        }
    }

    #[async_trait]
    impl StripeInvoiceClient for MockStripeClient {
        async fn retrieve_invoice(
            &self,
            invoice_id: &str,
            _expand: &[&str],
        ) -> Result<InvoiceObject> {
            self.check_failure("retrieve_invoice")?;
            self.record(format!("retrieve_invoice:{}", invoice_id));
            self.inner
                .invoices
                .read()
                .unwrap()
                .get(invoice_id)
                .cloned()
                .ok_or_else(|| resource_missing("retrieve_invoice", "invoice", invoice_id))
        }

        async fn upcoming_invoice(&self, params: &UpcomingInvoiceParams) -> Result<InvoiceObject> {
            self.check_failure("upcoming_invoice")?;
            self.record(format!("upcoming_invoice:{}", params.subscription));
            self.inner
                .upcoming
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| resource_missing("upcoming_invoice", "invoice", "upcoming"))
        }
    }

    #[async_trait]
    impl StripeCouponClient for MockStripeClient {
        async fn retrieve_coupon(&self, coupon_id: &str) -> Result<CouponObject> {
            self.check_failure("retrieve_coupon")?;
            self.record(format!("retrieve_coupon:{}", coupon_id));
            self.inner
                .coupons
                .read()
                .unwrap()
                .get(coupon_id)
                .cloned()
                .ok_or_else(|| resource_missing("retrieve_coupon", "coupon", coupon_id))
        }

        async fn create_coupon(&self, params: &CreateCouponParams) -> Result<CouponObject> {
            self.check_failure("create_coupon")?;
            self.record(format!("create_coupon:{}", params.id));
            let coupon = CouponObject {
                id: params.id.clone(),
                amount_off: Some(params.amount_off),
                currency: Some(params.currency.clone()),
                duration: params.duration,
                duration_in_months: params.duration_in_months,
                name: Some(params.name.clone()),
            };
            self.add_coupon(coupon.clone());
            Ok(coupon)
        }
    }

    #[async_trait]
    impl StripeCustomerClient for MockStripeClient {
        async fn retrieve_customer(&self, customer_id: &str) -> Result<CustomerObject> {
            self.check_failure("retrieve_customer")?;
            self.record(format!("retrieve_customer:{}", customer_id));
            Ok(self.customer(customer_id).unwrap_or_else(|| CustomerObject {
                id: customer_id.to_string(),
                balance: 0,
            }))
        }

        async fn update_customer_balance(
            &self,
            customer_id: &str,
            balance: i64,
        ) -> Result<CustomerObject> {
            self.check_failure("update_customer_balance")?;
            self.record(format!("update_customer_balance:{}", customer_id));
            let customer = CustomerObject { id: customer_id.to_string(), balance };
            self.add_customer(customer.clone());
            Ok(customer)
        }

        async fn create_refund(
            &self,
            payment_intent_id: &str,
            amount: i64,
        ) -> Result<RefundObject> {
            self.check_failure("create_refund")?;
            let refund = RefundObject {
                id: self.next_id("re"),
                amount,
                payment_intent: Some(payment_intent_id.to_string()),
            };
            self.record(format!("create_refund:{}", refund.id));
            self.inner.refunds.write().unwrap().push(refund.clone());
            Ok(refund)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockStripeClient;
    use super::*;
    use crate::billing::remote::{
        InvoiceItemParams, PaymentSettings, ProductData, RecurringParams, SubscriptionItemParams,
    };
    use crate::billing::canonical::Interval;
    use std::collections::BTreeMap;

    fn full_client<C: FullStripeClient>(client: C) -> C {
        client
    }

    #[tokio::test]
    async fn test_mock_subscription_mirrors_request() {
        let client = full_client(MockStripeClient::new());
        let recurring = client
            .create_price(&PriceShape {
                unit_amount: 1000,
                currency: "usd".to_string(),
                recurring: Some(RecurringParams { interval: Interval::Month, interval_count: 1 }),
                product_data: ProductData { name: "Plan".to_string() },
            })
            .await
            .unwrap();
        let once = client
            .create_price(&PriceShape {
                unit_amount: 500,
                currency: "usd".to_string(),
                recurring: None,
                product_data: ProductData { name: "One time payment".to_string() },
            })
            .await
            .unwrap();

        let params = SubscriptionParams {
            customer: "cus_1".to_string(),
            items: vec![SubscriptionItemParams {
                id: None,
                metadata: BTreeMap::new(),
                price: recurring.id.clone(),
                quantity: 1,
            }],
            payment_behavior: "default_incomplete".to_string(),
            expand: vec![],
            metadata: BTreeMap::new(),
            payment_settings: PaymentSettings {
                save_default_payment_method: "on_subscription".to_string(),
            },
            coupon: None,
            add_invoice_items: vec![InvoiceItemParams { price: once.id.clone(), quantity: 1 }],
            trial_end: None,
        };

        let sub = client.create_subscription(&params).await.unwrap();
        let invoice = sub.latest_invoice().unwrap();
        assert_eq!(invoice.lines.data.len(), 2);
        assert_eq!(invoice.total, 1500);
        assert_eq!(client.call_count("create_subscription"), 1);

        let missing = client.retrieve_subscription("sub_nope", &[]).await.unwrap_err();
        assert_eq!(missing.status_code(), 404);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let client = MockStripeClient::new();
        client.fail_on("retrieve_coupon");
        assert!(client.retrieve_coupon("any").await.is_err());
    }
}
