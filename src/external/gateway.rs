use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::PlanTier;
use crate::error::AppResult;
use crate::external::provider::ProviderSubscriptionSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingCycle::Monthly => write!(f, "monthly"),
            BillingCycle::Yearly => write!(f, "yearly"),
        }
    }
}

/// 支付网关边界
///
/// 每次网络调用都有超时，这里不重试；重试交给调用方（webhook 靠 Stripe 重投，对账靠下一轮）
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// 未配置密钥时为 false，此时调用返回 `AppError::GatewayDisabled`
    fn is_enabled(&self) -> bool;

    /// 返回托管收银台的跳转地址
    async fn create_checkout_session(
        &self,
        user_id: i64,
        tier: PlanTier,
        cycle: BillingCycle,
    ) -> AppResult<String>;

    async fn fetch_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<ProviderSubscriptionSnapshot>;

    /// 返回 false 即拒收，不会重试
    fn verify_signature(&self, raw_body: &[u8], signature_header: &str) -> bool;
}
