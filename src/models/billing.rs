use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::{PlanTier, SubscriptionStatus, subscription_entity};
use crate::external::BillingCycle;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    #[schema(example = "standard")]
    pub tier: PlanTier,
    #[schema(example = "monthly")]
    pub billing_cycle: BillingCycle,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    pub user_id: i64,
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriptionResponse {
    /// 尚未建档的用户视为免费套餐
    pub fn free(user_id: i64) -> Self {
        Self {
            user_id,
            tier: PlanTier::Free,
            status: SubscriptionStatus::Inactive,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            updated_at: None,
        }
    }
}

impl From<subscription_entity::Model> for SubscriptionResponse {
    fn from(row: subscription_entity::Model) -> Self {
        Self {
            user_id: row.user_id,
            tier: row.tier,
            status: row.status,
            stripe_subscription_id: row.stripe_subscription_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            updated_at: Some(row.updated_at),
        }
    }
}

/// Webhook 处理结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Ignored,
    Duplicate,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}
