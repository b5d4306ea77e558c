//! Stripe 报文解析
//!
//! webhook 外壳及其中的订阅 / 发票对象都按原始 JSON 解析，webhook 与对账拉取的对象共用同一套代码。

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::config::StripeConfig;
use crate::entities::PlanTier;
use crate::error::{AppError, AppResult};

pub const META_USER_ID: &str = "user_id";
pub const META_TIER: &str = "tier";

#[derive(Debug, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProviderEventData,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderEventData {
    pub object: Value,
}

impl ProviderEvent {
    pub fn parse(payload: &str) -> AppResult<Self> {
        let event: ProviderEvent = serde_json::from_str(payload)
            .map_err(|e| AppError::ValidationError(format!("Malformed webhook payload: {e}")))?;
        if event.id.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Webhook payload has an empty event id".to_string(),
            ));
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
    Irrelevant,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" => EventKind::PaymentSucceeded,
            "invoice.payment_failed" => EventKind::PaymentFailed,
            _ => EventKind::Irrelevant,
        }
    }

    pub fn carries_subscription(&self) -> bool {
        matches!(
            self,
            EventKind::SubscriptionCreated
                | EventKind::SubscriptionUpdated
                | EventKind::SubscriptionDeleted
        )
    }
}

/// Stripe 报告的订阅状态，比本地状态多；多出来的状态应用时都归为免费 / inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl ProviderStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(ProviderStatus::Trialing),
            "active" => Some(ProviderStatus::Active),
            "past_due" => Some(ProviderStatus::PastDue),
            "canceled" => Some(ProviderStatus::Canceled),
            "incomplete" => Some(ProviderStatus::Incomplete),
            "incomplete_expired" => Some(ProviderStatus::IncompleteExpired),
            "unpaid" => Some(ProviderStatus::Unpaid),
            "paused" => Some(ProviderStatus::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: ProviderStatus,
    pub tier: Option<PlanTier>,
    pub price_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl ProviderSubscriptionSnapshot {
    pub fn from_object(object: &Value) -> AppResult<Self> {
        let id = str_field(object, "id")
            .ok_or_else(|| AppError::ValidationError("Subscription object without id".into()))?;
        let raw_status = str_field(object, "status").unwrap_or_default();
        let status = ProviderStatus::parse(&raw_status).ok_or_else(|| {
            AppError::ValidationError(format!(
                "Subscription {id} has unknown status '{raw_status}'"
            ))
        })?;

        let first_item = object.pointer("/items/data/0");
        // 新版 API 把计费周期放在 subscription item 上
        let period = |field: &str| {
            timestamp(object.get(field))
                .or_else(|| first_item.and_then(|item| timestamp(item.get(field))))
        };
        let metadata = object.get("metadata");

        Ok(Self {
            customer_id: object.get("customer").and_then(id_of),
            status,
            tier: metadata
                .and_then(|m| m.get(META_TIER))
                .and_then(Value::as_str)
                .and_then(PlanTier::parse)
                .filter(PlanTier::is_paid),
            price_id: first_item
                .and_then(|item| item.get("price").or_else(|| item.get("plan")))
                .and_then(id_of),
            current_period_start: period("current_period_start"),
            current_period_end: period("current_period_end"),
            cancel_at_period_end: object
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            id,
        })
    }

    /// metadata 没有 tier 时按配置的价格表补全
    pub fn resolve_tier(&mut self, stripe: &StripeConfig) {
        if self.tier.is_none()
            && let Some(price_id) = self.price_id.as_deref()
        {
            self.tier = stripe.tier_for_price(price_id);
        }
    }
}

/// 状态机关心的发票字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSummary {
    pub id: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub user_id: Option<i64>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl InvoiceSummary {
    pub fn from_object(object: &Value) -> AppResult<Self> {
        let subscription_details = object
            .get("subscription_details")
            .or_else(|| object.pointer("/parent/subscription_details"));
        let subscription_id = object
            .get("subscription")
            .and_then(id_of)
            .or_else(|| {
                subscription_details
                    .and_then(|d| d.get("subscription"))
                    .and_then(id_of)
            });
        let first_line = object.pointer("/lines/data/0");
        let user_id = subscription_details
            .and_then(|d| d.get("metadata"))
            .and_then(metadata_user_id)
            .or_else(|| {
                first_line
                    .and_then(|l| l.get("metadata"))
                    .and_then(metadata_user_id)
            });

        Ok(Self {
            id: str_field(object, "id"),
            subscription_id,
            customer_id: object.get("customer").and_then(id_of),
            user_id,
            period_start: first_line.and_then(|l| timestamp(l.pointer("/period/start"))),
            period_end: first_line.and_then(|l| timestamp(l.pointer("/period/end"))),
        })
    }
}

/// 定位本地订阅所用的键，按查找顺序排列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub subscription_id: Option<String>,
    pub user_id: Option<i64>,
    pub customer_id: Option<String>,
}

impl SubscriptionRef {
    pub fn is_empty(&self) -> bool {
        self.subscription_id.is_none() && self.user_id.is_none() && self.customer_id.is_none()
    }
}

impl ProviderEvent {
    pub fn subscription_ref(&self) -> SubscriptionRef {
        let object = &self.data.object;
        match self.kind() {
            kind if kind.carries_subscription() => SubscriptionRef {
                subscription_id: str_field(object, "id"),
                user_id: object.get("metadata").and_then(metadata_user_id),
                customer_id: object.get("customer").and_then(id_of),
            },
            EventKind::PaymentSucceeded | EventKind::PaymentFailed => {
                InvoiceSummary::from_object(object)
                    .map(|invoice| SubscriptionRef {
                        subscription_id: invoice.subscription_id,
                        user_id: invoice.user_id,
                        customer_id: invoice.customer_id,
                    })
                    .unwrap_or_default()
            }
            _ => SubscriptionRef::default(),
        }
    }
}

/// 从已存储的 payload 中取出定位键
pub fn subscription_ref_in_payload(payload: &str) -> Option<SubscriptionRef> {
    ProviderEvent::parse(payload)
        .ok()
        .map(|event| event.subscription_ref())
        .filter(|r| !r.is_empty())
}

fn str_field(object: &Value, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 字段可能是 ID 字符串，也可能是展开后的对象
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => str_field(value, "id"),
        _ => None,
    }
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn metadata_user_id(metadata: &Value) -> Option<i64> {
    match metadata.get(META_USER_ID)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
