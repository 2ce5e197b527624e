//! Storefront collaborator.
//!
//! Orders, carts and products live in the storefront. The engine reads and
//! mutates them only through [`OrderGateway`].

use super::cart::{Address, Cart, Order, Product};
use super::remote::InvoiceObject;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Carrier and method picked at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingMethod {
    pub carrier_code: String,
    pub method_code: String,
}

/// Checkout details submitted with a subscription update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutDetails {
    pub billing_address: Address,
    #[serde(default)]
    pub shipping_address: Option<Address>,
    #[serde(default)]
    pub shipping_method: Option<ShippingMethod>,
    /// `None` removes any coupon from the cart
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// Access to storefront orders, carts and products.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn load_order(&self, increment_id: &str) -> Result<Option<Order>>;

    async fn load_cart(&self, cart_id: &str) -> Result<Option<Cart>>;

    async fn load_product(&self, product_id: &str) -> Result<Option<Product>>;

    /// Apply addresses, shipping method and coupon, then recollect totals.
    async fn apply_checkout_details(
        &self,
        cart_id: &str,
        details: &CheckoutDetails,
    ) -> Result<Cart>;

    /// Place an order from the cart.
    async fn submit_cart(&self, cart_id: &str) -> Result<Order>;

    /// Keep the cart around for recurring orders but stop using it for checkout.
    async fn deactivate_cart(&self, cart_id: &str) -> Result<()>;

    /// Stop using a cart for recurring orders.
    async fn release_recurring_cart(&self, cart_id: &str) -> Result<()>;

    /// Remove every item from the cart.
    async fn clear_cart(&self, cart_id: &str) -> Result<()>;

    async fn add_order_comment(&self, increment_id: &str, comment: &str) -> Result<()>;

    /// Cancel the order, or close it when it can no longer be canceled.
    /// Returns whether the order was canceled.
    async fn cancel_order(&self, increment_id: &str) -> Result<bool>;

    async fn set_processing(&self, increment_id: &str, comment: &str) -> Result<()>;

    /// Create an offline invoice for the order.
    async fn invoice_order_offline(
        &self,
        increment_id: &str,
        transaction_id: Option<&str>,
    ) -> Result<()>;

    /// Create an offline credit memo for a base currency amount.
    async fn refund_order_offline(&self, increment_id: &str, base_amount: f64) -> Result<()>;

    /// Record a refund issued from the Stripe dashboard.
    async fn record_refund(
        &self,
        increment_id: &str,
        amount_minor: i64,
        currency: &str,
    ) -> Result<()>;

    /// Create a recurring order from a paid renewal invoice.
    async fn create_recurring_order_from_invoice(&self, invoice: &InvoiceObject) -> Result<Order>;

    /// Create a recurring order from the cart of an in-place update.
    async fn create_recurring_order_from_cart(
        &self,
        cart_id: &str,
        invoice_id: &str,
    ) -> Result<Order>;
}

/// In-memory storefront for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::cart::OrderState;
    use crate::error::SubsyncError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock storefront.
    #[derive(Clone, Default)]
    pub struct MockOrderGateway {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        next_increment: AtomicU64,
        orders: RwLock<HashMap<String, Order>>,
        carts: RwLock<HashMap<String, Cart>>,
        products: RwLock<HashMap<String, Product>>,
        comments: RwLock<Vec<(String, String)>>,
        inactive_carts: RwLock<Vec<String>>,
        released_carts: RwLock<Vec<String>>,
        offline_invoices: RwLock<Vec<String>>,
        offline_refunds: RwLock<Vec<(String, f64)>>,
        refunds: RwLock<Vec<(String, i64)>>,
        recurring_orders: RwLock<Vec<Order>>,
        applied_details: RwLock<Vec<(String, CheckoutDetails)>>,
        failing: RwLock<HashSet<String>>,
    }

    impl MockOrderGateway {
        #[must_use]
        pub fn new() -> Self {
            let gateway = Self::default();
            gateway.inner.next_increment.store(200, Ordering::SeqCst);
            gateway
        }

        pub fn add_order(&self, order: Order) {
            self.inner
                .orders
                .write()
                .unwrap()
                .insert(order.increment_id.clone(), order);
        }

        pub fn add_cart(&self, cart: Cart) {
            for item in &cart.items {
                self.add_product(item.product.clone());
            }
            self.inner.carts.write().unwrap().insert(cart.id.clone(), cart);
        }

        pub fn add_product(&self, product: Product) {
            self.inner.products.write().unwrap().insert(product.id.clone(), product);
        }

        pub fn order(&self, increment_id: &str) -> Option<Order> {
            self.inner.orders.read().unwrap().get(increment_id).cloned()
        }

        pub fn cart(&self, cart_id: &str) -> Option<Cart> {
            self.inner.carts.read().unwrap().get(cart_id).cloned()
        }

        /// Comments added to an order, oldest first.
        pub fn comments(&self, increment_id: &str) -> Vec<String> {
            self.inner
                .comments
                .read()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == increment_id)
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn recurring_orders(&self) -> Vec<Order> {
            self.inner.recurring_orders.read().unwrap().clone()
        }

        pub fn inactive_carts(&self) -> Vec<String> {
            self.inner.inactive_carts.read().unwrap().clone()
        }

        pub fn released_carts(&self) -> Vec<String> {
            self.inner.released_carts.read().unwrap().clone()
        }

        pub fn offline_invoices(&self) -> Vec<String> {
            self.inner.offline_invoices.read().unwrap().clone()
        }

        pub fn offline_refunds(&self) -> Vec<(String, f64)> {
            self.inner.offline_refunds.read().unwrap().clone()
        }

        pub fn recorded_refunds(&self) -> Vec<(String, i64)> {
            self.inner.refunds.read().unwrap().clone()
        }

        pub fn applied_details(&self) -> Vec<(String, CheckoutDetails)> {
            self.inner.applied_details.read().unwrap().clone()
        }

        /// Make every later call to `operation` fail.
        pub fn fail_on(&self, operation: &str) {
            self.inner.failing.write().unwrap().insert(operation.to_string());
        }

        fn check_failure(&self, operation: &str) -> Result<()> {
            if self.inner.failing.read().unwrap().contains(operation) {
                return Err(SubsyncError::service_unavailable(format!("{} failed", operation)));
            }
            Ok(())
        }

        fn next_increment_id(&self) -> String {
            let n = self.inner.next_increment.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{:09}", n)
        }

        fn order_from_cart(&self, cart: &Cart, increment_id: String) -> Order {
            Order {
                increment_id,
                quote_id: cart.id.clone(),
                customer_id: cart.customer_id.clone(),
                currency: cart.currency.clone(),
                base_currency: cart.base_currency.clone(),
                base_to_order_rate: cart.base_to_quote_rate,
                items: cart.items.clone(),
                grand_total: cart.grand_total,
                base_grand_total: cart.grand_total,
                is_virtual: cart.is_virtual,
                state: OrderState::PendingPayment,
                applied_coupons: cart.applied_coupons.clone(),
                payment: cart.payment.clone(),
            }
        }

        fn with_order<F: FnOnce(&mut Order)>(&self, increment_id: &str, f: F) -> Result<()> {
            let mut orders = self.inner.orders.write().unwrap();
            let order = orders
                .get_mut(increment_id)
                .ok_or_else(|| SubsyncError::not_found(format!("order {}", increment_id)))?;
            f(order);
            Ok(())
        }
    }

    #[async_trait]
    impl OrderGateway for MockOrderGateway {
        async fn load_order(&self, increment_id: &str) -> Result<Option<Order>> {
            Ok(self.order(increment_id))
        }

        async fn load_cart(&self, cart_id: &str) -> Result<Option<Cart>> {
            Ok(self.cart(cart_id))
        }

        async fn load_product(&self, product_id: &str) -> Result<Option<Product>> {
            Ok(self.inner.products.read().unwrap().get(product_id).cloned())
        }

        async fn apply_checkout_details(
            &self,
            cart_id: &str,
            details: &CheckoutDetails,
        ) -> Result<Cart> {
            self.inner
                .applied_details
                .write()
                .unwrap()
                .push((cart_id.to_string(), details.clone()));
            self.cart(cart_id)
                .ok_or_else(|| SubsyncError::not_found(format!("cart {}", cart_id)))
        }

        async fn submit_cart(&self, cart_id: &str) -> Result<Order> {
            let cart = self
                .cart(cart_id)
                .ok_or_else(|| SubsyncError::not_found(format!("cart {}", cart_id)))?;
            let increment_id = cart
                .reserved_order_id
                .clone()
                .unwrap_or_else(|| self.next_increment_id());
            let order = self.order_from_cart(&cart, increment_id);
            self.add_order(order.clone());
            Ok(order)
        }

        async fn deactivate_cart(&self, cart_id: &str) -> Result<()> {
            self.check_failure("deactivate_cart")?;
            self.inner.inactive_carts.write().unwrap().push(cart_id.to_string());
            Ok(())
        }

        async fn release_recurring_cart(&self, cart_id: &str) -> Result<()> {
            self.check_failure("release_recurring_cart")?;
            self.inner.released_carts.write().unwrap().push(cart_id.to_string());
            Ok(())
        }

        async fn clear_cart(&self, cart_id: &str) -> Result<()> {
            if let Some(cart) = self.inner.carts.write().unwrap().get_mut(cart_id) {
                cart.items.clear();
            }
            Ok(())
        }

        async fn add_order_comment(&self, increment_id: &str, comment: &str) -> Result<()> {
            self.check_failure("add_order_comment")?;
            self.inner
                .comments
                .write()
                .unwrap()
                .push((increment_id.to_string(), comment.to_string()));
            Ok(())
        }

        async fn cancel_order(&self, increment_id: &str) -> Result<bool> {
            let mut canceled = false;
            self.with_order(increment_id, |order| {
                if order.is_pending_payment() {
                    order.state = OrderState::Canceled;
                    canceled = true;
                } else {
                    order.state = OrderState::Closed;
                }
            })?;
            Ok(canceled)
        }

        async fn set_processing(&self, increment_id: &str, comment: &str) -> Result<()> {
            self.check_failure("set_processing")?;
            self.with_order(increment_id, |order| order.state = OrderState::Processing)?;
            self.add_order_comment(increment_id, comment).await
        }

        async fn invoice_order_offline(
            &self,
            increment_id: &str,
            _transaction_id: Option<&str>,
        ) -> Result<()> {
            self.inner
                .offline_invoices
                .write()
                .unwrap()
                .push(increment_id.to_string());
            Ok(())
        }

        async fn refund_order_offline(&self, increment_id: &str, base_amount: f64) -> Result<()> {
            self.inner
                .offline_refunds
                .write()
                .unwrap()
                .push((increment_id.to_string(), base_amount));
            Ok(())
        }

        async fn record_refund(
            &self,
            increment_id: &str,
            amount_minor: i64,
            _currency: &str,
        ) -> Result<()> {
            self.inner
                .refunds
                .write()
                .unwrap()
                .push((increment_id.to_string(), amount_minor));
            Ok(())
        }

        async fn create_recurring_order_from_invoice(
            &self,
            invoice: &InvoiceObject,
        ) -> Result<Order> {
            let original_id = invoice
                .subscription
                .as_ref()
                .and_then(|s| s.as_object())
                .and_then(|s| s.order_increment_id())
                .map(str::to_string)
                .ok_or_else(|| SubsyncError::not_found("original order of invoice"))?;
            let original = self
                .order(&original_id)
                .ok_or_else(|| SubsyncError::not_found(format!("order {}", original_id)))?;

            let mut order = original.clone();
            order.increment_id = self.next_increment_id();
            order.state = OrderState::Processing;
            self.add_order(order.clone());
            self.inner.recurring_orders.write().unwrap().push(order.clone());
            Ok(order)
        }

        async fn create_recurring_order_from_cart(
            &self,
            cart_id: &str,
            _invoice_id: &str,
        ) -> Result<Order> {
            let cart = self
                .cart(cart_id)
                .ok_or_else(|| SubsyncError::not_found(format!("cart {}", cart_id)))?;
            let mut order = self.order_from_cart(&cart, self.next_increment_id());
            order.state = OrderState::Processing;
            self.add_order(order.clone());
            self.inner.recurring_orders.write().unwrap().push(order.clone());
            Ok(order)
        }
    }
}
