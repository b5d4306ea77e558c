//! 测试用假网关与报文构造器，用来模拟延迟、重复和乱序的 Stripe 推送

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::entities::PlanTier;
use crate::error::{AppError, AppResult};
use crate::external::gateway::{BillingCycle, PaymentGateway};
use crate::external::provider::ProviderSubscriptionSnapshot;

pub const FAKE_SIGNATURE: &str = "t=0,v1=fake-signature";

pub struct FakeGateway {
    enabled: bool,
    snapshots: Mutex<HashMap<String, Value>>,
    unreachable: Mutex<HashSet<String>>,
    fetch_calls: AtomicUsize,
    checkouts: Mutex<Vec<(i64, PlanTier, BillingCycle)>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            enabled: true,
            snapshots: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            fetch_calls: AtomicUsize::new(0),
            checkouts: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// 设置 Stripe 侧该订阅的当前状态
    pub fn set_subscription(&self, object: Value) {
        let id = object["id"].as_str().unwrap_or_default().to_string();
        self.snapshots.lock().unwrap().insert(id, object);
    }

    /// 在清除前，拉取 `id` 一律超时
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn checkouts(&self) -> Vec<(i64, PlanTier, BillingCycle)> {
        self.checkouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn create_checkout_session(
        &self,
        user_id: i64,
        tier: PlanTier,
        cycle: BillingCycle,
    ) -> AppResult<String> {
        if !self.enabled {
            return Err(AppError::GatewayDisabled);
        }
        self.checkouts.lock().unwrap().push((user_id, tier, cycle));
        Ok(format!("https://checkout.test/{user_id}/{tier}/{cycle}"))
    }

    async fn fetch_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<ProviderSubscriptionSnapshot> {
        if !self.enabled {
            return Err(AppError::GatewayDisabled);
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .unreachable
            .lock()
            .unwrap()
            .contains(stripe_subscription_id)
        {
            return Err(AppError::GatewayTimeout(format!(
                "fetch_subscription {stripe_subscription_id}"
            )));
        }
        let object = self
            .snapshots
            .lock()
            .unwrap()
            .get(stripe_subscription_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("No such subscription: {stripe_subscription_id}"))
            })?;
        ProviderSubscriptionSnapshot::from_object(&object)
    }

    fn verify_signature(&self, _raw_body: &[u8], signature_header: &str) -> bool {
        signature_header == FAKE_SIGNATURE
    }
}

pub struct SubscriptionObject<'a> {
    pub id: &'a str,
    pub customer: &'a str,
    pub status: &'a str,
    pub user_id: i64,
    pub tier: PlanTier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionObject<'_> {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "object": "subscription",
            "customer": self.customer,
            "status": self.status,
            "current_period_start": self.period_start.timestamp(),
            "current_period_end": self.period_end.timestamp(),
            "cancel_at_period_end": self.cancel_at_period_end,
            "metadata": {"user_id": self.user_id.to_string(), "tier": self.tier.to_string()},
            "items": {"data": [{"price": {"id": format!("price_{}_monthly", self.tier)}}]}
        })
    }
}

pub fn invoice_object(
    subscription_id: &str,
    customer: &str,
    user_id: i64,
    period: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Value {
    let lines = match period {
        Some((start, end)) => json!([{"period": {"start": start.timestamp(), "end": end.timestamp()}}]),
        None => json!([]),
    };
    json!({
        "id": format!("in_{subscription_id}"),
        "object": "invoice",
        "customer": customer,
        "subscription": subscription_id,
        "subscription_details": {"metadata": {"user_id": user_id.to_string()}},
        "lines": {"data": lines}
    })
}

pub fn event_payload(event_id: &str, event_type: &str, object: Value) -> Vec<u8> {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "data": {"object": object}
    })
    .to_string()
    .into_bytes()
}
