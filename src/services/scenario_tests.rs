//! 跨服务场景测试：手动时钟、内存存储与假网关

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::{BillingConfig, StripeConfig};
use crate::database::memory::{MemoryEventStore, MemorySubscriptionStore};
use crate::entities::{PlanTier, SubscriptionStatus};
use crate::external::BillingCycle;
use crate::external::ProviderEvent;
use crate::external::fake::{
    FAKE_SIGNATURE, FakeGateway, SubscriptionObject, event_payload, invoice_object,
};
use crate::models::WebhookOutcome;
use crate::services::subscription_machine::{BillingEvent, SubscriptionState, transition};
use crate::services::{
    CheckoutService, EntitlementService, ReconciliationService, SubscriptionService,
    WebhookService,
};
use crate::utils::ManualClock;

struct World {
    clock: Arc<ManualClock>,
    store: Arc<MemorySubscriptionStore>,
    gateway: Arc<FakeGateway>,
    subscriptions: SubscriptionService,
    webhooks: WebhookService,
    reconciliation: ReconciliationService,
    entitlements: EntitlementService,
    checkout: CheckoutService,
}

fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 9, 0, 0).unwrap()
}

fn world() -> World {
    let billing = BillingConfig::default();
    let clock = Arc::new(ManualClock::new(day0()));
    let store = Arc::new(MemorySubscriptionStore::new());
    let events = Arc::new(MemoryEventStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let subscriptions = SubscriptionService::new(store.clone(), clock.clone(), billing.max_write_attempts);
    World {
        webhooks: WebhookService::new(
            events.clone(),
            subscriptions.clone(),
            gateway.clone(),
            StripeConfig::default(),
            billing.pending_reclaim_after(),
        ),
        reconciliation: ReconciliationService::new(
            subscriptions.clone(),
            events,
            gateway.clone(),
            billing.clone(),
        ),
        entitlements: EntitlementService::new(store.clone(), clock.clone(), billing.grace_period()),
        checkout: CheckoutService::new(subscriptions.clone(), gateway.clone()),
        clock,
        store,
        gateway,
        subscriptions,
    }
}

fn subscription(status: &'static str, end: DateTime<Utc>, cancel: bool) -> serde_json::Value {
    SubscriptionObject {
        id: "sub_42",
        customer: "cus_42",
        status,
        user_id: 42,
        tier: PlanTier::Standard,
        period_start: end - Duration::days(14),
        period_end: end,
        cancel_at_period_end: cancel,
    }
    .to_json()
}

async fn deliver(w: &World, id: &str, event_type: &str, object: serde_json::Value) -> WebhookOutcome {
    w.webhooks
        .handle(&event_payload(id, event_type, object), FAKE_SIGNATURE)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_free_to_trial_to_grace_to_free() {
    let w = world();
    let grace = BillingConfig::default().grace_period();

    w.subscriptions.provision(42).await.unwrap();
    assert_eq!(w.entitlements.entitlement(42).await.unwrap().tier, PlanTier::Free);

    let checkout = w
        .checkout
        .start_checkout(42, PlanTier::Standard, BillingCycle::Monthly)
        .await
        .unwrap();
    assert!(checkout.checkout_url.starts_with("https://checkout.test/42/"));

    // 用户完成支付，Stripe 发来 created(trialing)
    let trial_end = day0() + Duration::days(14);
    let created = subscription("trialing", trial_end, false);
    w.gateway.set_subscription(created.clone());
    assert_eq!(
        deliver(&w, "evt_1", "customer.subscription.created", created).await,
        WebhookOutcome::Processed
    );
    let e = w.entitlements.entitlement(42).await.unwrap();
    assert!(e.entitled);
    assert_eq!(e.tier, PlanTier::Standard);
    assert_eq!(e.status, SubscriptionStatus::Trialing);

    // 试用期结束时扣款失败
    w.clock.set(trial_end + Duration::minutes(5));
    assert_eq!(
        deliver(
            &w,
            "evt_2",
            "invoice.payment_failed",
            invoice_object("sub_42", "cus_42", 42, None)
        )
        .await,
        WebhookOutcome::Processed
    );
    let e = w.entitlements.entitlement(42).await.unwrap();
    assert_eq!(e.status, SubscriptionStatus::PastDue);
    assert!(e.entitled);
    assert!(e.in_grace_or_cancellation);
    assert_eq!(e.access_until, Some(trial_end + grace));

    // 宽限期结束，没有任何新 webhook
    w.clock.set(trial_end + grace + Duration::minutes(1));
    let e = w.entitlements.entitlement(42).await.unwrap();
    assert!(!e.entitled);
    assert_eq!(e.tier, PlanTier::Free);

    // Stripe 侧仍是 past_due，当前未付周期从 trial_end 开始
    let mut still_past_due = subscription("past_due", trial_end + Duration::days(30), false);
    still_past_due["current_period_start"] = serde_json::json!(trial_end.timestamp());
    w.gateway.set_subscription(still_past_due);

    let report = w.reconciliation.run_once().await.unwrap();
    assert_eq!(report.updated, 1);
    let row = w.subscriptions.find_by_user(42).await.unwrap().unwrap();
    assert_eq!(row.tier, PlanTier::Free);
    assert_eq!(row.status, SubscriptionStatus::Inactive);
    assert_eq!(row.stripe_subscription_id, None);
    assert_eq!(row.stripe_customer_id, None);

    let writes = w.store.writes();
    let again = w.reconciliation.run_once().await.unwrap();
    assert_eq!(again.updated, 0);
    assert_eq!(w.store.writes(), writes);
}

#[tokio::test]
async fn test_redelivered_events_change_nothing() {
    let w = world();
    w.subscriptions.provision(42).await.unwrap();
    let created = subscription("active", day0() + Duration::days(30), false);
    deliver(&w, "evt_1", "customer.subscription.created", created.clone()).await;
    deliver(
        &w,
        "evt_2",
        "invoice.payment_failed",
        invoice_object("sub_42", "cus_42", 42, None),
    )
    .await;
    let settled = w.subscriptions.find_by_user(42).await.unwrap().unwrap();
    let writes = w.store.writes();

    for (id, event_type, object) in [
        ("evt_1", "customer.subscription.created", created),
        (
            "evt_2",
            "invoice.payment_failed",
            invoice_object("sub_42", "cus_42", 42, None),
        ),
    ] {
        for _ in 0..3 {
            assert_eq!(
                deliver(&w, id, event_type, object.clone()).await,
                WebhookOutcome::Duplicate
            );
        }
    }
    assert_eq!(w.store.writes(), writes);
    assert_eq!(w.subscriptions.find_by_user(42).await.unwrap().unwrap(), settled);
}

#[tokio::test]
async fn test_cancellation_takes_effect_without_a_webhook() {
    let w = world();
    let period_end = day0() + Duration::days(10);
    w.subscriptions.provision(42).await.unwrap();
    deliver(
        &w,
        "evt_1",
        "customer.subscription.created",
        subscription("active", period_end, false),
    )
    .await;
    deliver(
        &w,
        "evt_2",
        "customer.subscription.updated",
        subscription("active", period_end, true),
    )
    .await;

    let e = w.entitlements.entitlement(42).await.unwrap();
    assert!(e.entitled && e.in_grace_or_cancellation);
    assert_eq!(e.access_until, Some(period_end));

    w.clock.set(period_end + Duration::seconds(1));
    let e = w.entitlements.entitlement(42).await.unwrap();
    assert!(!e.entitled);
    assert_eq!(e.tier, PlanTier::Free);
}

#[tokio::test]
async fn test_out_of_order_deletion_then_update() {
    let w = world();
    let period_end = day0() + Duration::days(10);
    w.subscriptions.provision(42).await.unwrap();
    deliver(
        &w,
        "evt_1",
        "customer.subscription.created",
        subscription("active", period_end, false),
    )
    .await;
    assert_eq!(
        deliver(
            &w,
            "evt_3",
            "customer.subscription.deleted",
            subscription("canceled", period_end, true),
        )
        .await,
        WebhookOutcome::Processed
    );
    // 迟到的 updated(active) 不能复活已取消的订阅
    assert_eq!(
        deliver(
            &w,
            "evt_2",
            "customer.subscription.updated",
            subscription("active", period_end, true),
        )
        .await,
        WebhookOutcome::Failed
    );
    let row = w.subscriptions.find_by_user(42).await.unwrap().unwrap();
    assert_eq!(row.status, SubscriptionStatus::Canceled);
    assert!(row.cancel_at_period_end);
}

#[tokio::test]
async fn test_concurrent_events_match_a_serial_order() {
    let w = world();
    let period_end = day0() + Duration::days(30);
    w.subscriptions.provision(42).await.unwrap();
    deliver(
        &w,
        "evt_1",
        "customer.subscription.created",
        subscription("active", period_end, false),
    )
    .await;
    let initial = SubscriptionState::from(&w.subscriptions.find_by_user(42).await.unwrap().unwrap());

    let renewed_end = period_end + Duration::days(30);
    let deliveries = [
        (
            "evt_a",
            "invoice.payment_failed",
            invoice_object("sub_42", "cus_42", 42, None),
        ),
        (
            "evt_b",
            "invoice.payment_succeeded",
            invoice_object("sub_42", "cus_42", 42, Some((period_end, renewed_end))),
        ),
        (
            "evt_c",
            "customer.subscription.updated",
            subscription("active", period_end, true),
        ),
    ];

    // 所有串行顺序下可能的最终状态
    let events: Vec<BillingEvent> = deliveries
        .iter()
        .map(|(id, event_type, object)| {
            let raw = event_payload(id, event_type, object.clone());
            let parsed = ProviderEvent::parse(std::str::from_utf8(&raw).unwrap()).unwrap();
            BillingEvent::from_provider(&parsed, &StripeConfig::default())
                .unwrap()
                .unwrap()
        })
        .collect();
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let serial_outcomes: Vec<SubscriptionState> = orders
        .iter()
        .map(|order| {
            order.iter().fold(initial.clone(), |state, &i| {
                match transition(&state, &events[i], day0()) {
                    Ok(t) => t.next,
                    Err(_) => state,
                }
            })
        })
        .collect();

    let [(a_id, a_type, a_obj), (b_id, b_type, b_obj), (c_id, c_type, c_obj)] = deliveries;
    let (a, b, c) = tokio::join!(
        deliver(&w, a_id, a_type, a_obj),
        deliver(&w, b_id, b_type, b_obj),
        deliver(&w, c_id, c_type, c_obj),
    );
    for outcome in [a, b, c] {
        assert!(matches!(outcome, WebhookOutcome::Processed | WebhookOutcome::Failed));
    }

    let row = w.subscriptions.find_by_user(42).await.unwrap().unwrap();
    let final_state = SubscriptionState::from(&row);
    assert!(
        serial_outcomes.contains(&final_state),
        "{final_state:?} is not reachable by any serial order"
    );
    // 续费发票无论先后都会生效，周期不会倒退
    assert_eq!(row.current_period_end, Some(renewed_end));
}
