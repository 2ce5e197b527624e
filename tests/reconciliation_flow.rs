//! Checkout and plan change driven through the public API with the
//! in-memory doubles.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stripe_subsync::billing::client::test::MockStripeClient;
use stripe_subsync::billing::orders::test::MockOrderGateway;
use stripe_subsync::billing::storage::test::InMemorySubscriptionStore;
use stripe_subsync::billing::remote::ProrationBehavior;
use stripe_subsync::billing::{
    BillingError, CachedUpdateIntentStore, Cart, CheckoutDetails, CurrentSubscription,
    InitialPayment, Order, Product, SubscriptionReconciler, SubscriptionStore, SubscriptionUpdater,
    UpdateIntent, UpdateIntentStore, UpdateOutcome, UpdateRequest,
};
use stripe_subsync::{ConfigBuilder, InMemoryCache};

const NOW: i64 = 1_700_000_000;

fn monthly_product(id: &str) -> Product {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Plan {}", id),
        "is_virtual": true,
        "subscription": {
            "enabled": true,
            "interval": "month",
            "interval_count": 1
        }
    }))
    .unwrap()
}

fn cart(id: &str, product: &Product, price: f64, reserved_order: Option<&str>) -> Cart {
    serde_json::from_value(json!({
        "id": id,
        "customer_id": "42",
        "stripe_customer_id": "cus_flow",
        "currency": "USD",
        "base_currency": "USD",
        "is_virtual": true,
        "reserved_order_id": reserved_order,
        "grand_total": price,
        "items": [{
            "item_id": format!("item-{}", product.id),
            "product": product,
            "name": product.name,
            "qty": 1.0,
            "price": price,
            "base_price": price,
            "price_incl_tax": price,
            "base_price_incl_tax": price
        }]
    }))
    .unwrap()
}

fn order_for(cart: &Cart, increment_id: &str) -> Order {
    serde_json::from_value(json!({
        "increment_id": increment_id,
        "quote_id": cart.id,
        "customer_id": cart.customer_id,
        "currency": cart.currency,
        "base_currency": cart.base_currency,
        "base_to_order_rate": 1.0,
        "items": cart.items,
        "grand_total": cart.grand_total,
        "base_grand_total": cart.grand_total,
        "is_virtual": true,
        "state": "pending_payment"
    }))
    .unwrap()
}

#[tokio::test]
async fn checkout_creates_and_links_one_subscription() {
    let client = MockStripeClient::new();
    let store = InMemorySubscriptionStore::new();
    let config = ConfigBuilder::new().build().unwrap();
    let reconciler = SubscriptionReconciler::new(client.clone(), InMemoryCache::new(100), &config);

    let product = monthly_product("10");
    let cart = cart("1", &product, 10.0, Some("000000100"));
    let initial = InitialPayment::none("usd");

    // Payment step renders several times before the order is placed
    let first = reconciler.reconcile(&cart, None, &initial, NOW).await.unwrap().unwrap();
    let again = reconciler
        .reconcile(&cart, Some(&first.id), &initial, NOW)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, again.id);

    let order = order_for(&cart, "000000100");
    let placed = reconciler
        .reconcile_order(&order, &cart, Some(&first.id), &initial, &store, NOW)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(placed.id, first.id);
    assert_eq!(placed.order_increment_id(), Some("000000100"));
    assert_eq!(client.call_count("create_subscription"), 1);
    assert_eq!(client.call_count("create_price"), 1);

    let entry = store.get_entry(&placed.id).await.unwrap().unwrap();
    assert_eq!(entry.order_increment_id.as_deref(), Some("000000100"));
}

#[tokio::test]
async fn changed_cart_is_refused_after_order_placement() {
    let client = MockStripeClient::new();
    let store = InMemorySubscriptionStore::new();
    let config = ConfigBuilder::new().build().unwrap();
    let reconciler = SubscriptionReconciler::new(client.clone(), InMemoryCache::new(100), &config);
    let initial = InitialPayment::none("usd");

    let product = monthly_product("10");
    let original = reconciler
        .reconcile(&cart("1", &product, 10.0, Some("000000100")), None, &initial, NOW)
        .await
        .unwrap()
        .unwrap();

    let changed = cart("1", &product, 15.0, Some("000000100"));
    let err = reconciler
        .reconcile_order(
            &order_for(&changed, "000000100"),
            &changed,
            Some(&original.id),
            &initial,
            &store,
            NOW,
        )
        .await
        .unwrap_err();

    assert_eq!(err.as_billing(), Some(&BillingError::CartChanged));
    assert_eq!(err.status_code(), 400);
    assert!(store.get_entry(&original.id).await.unwrap().is_none());
}

#[tokio::test]
async fn prorated_upgrade_places_a_new_order() {
    let client = MockStripeClient::new();
    let gateway = MockOrderGateway::new();
    let store = InMemorySubscriptionStore::new();
    let config = ConfigBuilder::new().build().unwrap();
    let reconciler = Arc::new(SubscriptionReconciler::new(
        client.clone(),
        InMemoryCache::new(100),
        &config,
    ));
    let intents = Arc::new(CachedUpdateIntentStore::new(
        InMemoryCache::new(100),
        Duration::from_secs(3600),
    ));
    let updater = SubscriptionUpdater::new(
        reconciler.clone(),
        Arc::new(gateway.clone()),
        Arc::new(store.clone()),
        intents.clone(),
    );

    // Existing subscription on the basic plan
    let basic = monthly_product("10");
    gateway.add_product(basic.clone());
    let checkout = cart("1", &basic, 10.0, Some("000000100"));
    let subscription = reconciler
        .reconcile_order(
            &order_for(&checkout, "000000100"),
            &checkout,
            None,
            &InitialPayment::none("usd"),
            &store,
            NOW,
        )
        .await
        .unwrap()
        .unwrap();

    // Customer picks the premium plan in a fresh cart
    let premium = monthly_product("11");
    gateway.add_cart(cart("2", &premium, 20.0, None));

    let current = CurrentSubscription::new(subscription.clone(), vec![basic]);
    let mut intent = UpdateIntent::for_subscription(&current);
    intent.proration_timestamp = Some(NOW);
    intents.save("sess", &intent).await.unwrap();

    let request = UpdateRequest {
        session_id: "sess".to_string(),
        logged_in: true,
        cart_id: Some("2".to_string()),
        details: CheckoutDetails::default(),
    };
    let outcome = updater.perform_update(&request, NOW).await.unwrap();

    let UpdateOutcome::NewOrderPlaced { order, subscription: updated } = outcome else {
        panic!("an upgrade with prorations places a new order");
    };
    assert_eq!(updated.id, subscription.id);
    assert_eq!(updated.order_increment_id(), Some(order.increment_id.as_str()));

    let (_, params) = client.updates().pop().unwrap();
    assert_eq!(params.proration_behavior, Some(ProrationBehavior::AlwaysInvoice));
    assert_eq!(params.proration_date, Some(NOW));

    let entry = store.get_entry(&subscription.id).await.unwrap().unwrap();
    assert_eq!(entry.order_increment_id.as_deref(), Some(order.increment_id.as_str()));

    // The intent is consumed
    assert!(intents.load("sess").await.unwrap().is_none());
    let err = updater.perform_update(&request, NOW).await.unwrap_err();
    assert_eq!(err.as_billing(), Some(&BillingError::MissingUpdateIntent));
}
