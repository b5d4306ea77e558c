use std::sync::Arc;

use crate::entities::{PlanTier, SubscriptionStatus};
use crate::error::{AppError, AppResult};
use crate::external::{BillingCycle, PaymentGateway};
use crate::models::CheckoutResponse;
use crate::services::subscription_service::SubscriptionService;

#[derive(Clone)]
pub struct CheckoutService {
    subscriptions: SubscriptionService,
    gateway: Arc<dyn PaymentGateway>,
}

impl CheckoutService {
    pub fn new(subscriptions: SubscriptionService, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            subscriptions,
            gateway,
        }
    }

    /// 创建 Stripe Checkout 会话；订阅本身要等 webhook 到达后才生效
    pub async fn start_checkout(
        &self,
        user_id: i64,
        tier: PlanTier,
        cycle: BillingCycle,
    ) -> AppResult<CheckoutResponse> {
        if !tier.is_paid() {
            return Err(AppError::ValidationError(
                "The free tier does not need a checkout".to_string(),
            ));
        }
        if !self.gateway.is_enabled() {
            return Err(AppError::GatewayDisabled);
        }

        let current = self.subscriptions.provision(user_id).await?;
        if current.stripe_subscription_id.is_some()
            && matches!(
                current.status,
                SubscriptionStatus::Trialing
                    | SubscriptionStatus::Active
                    | SubscriptionStatus::PastDue
                    | SubscriptionStatus::Incomplete
            )
        {
            return Err(AppError::ValidationError(format!(
                "User already has a {} {} subscription",
                current.status, current.tier
            )));
        }

        let checkout_url = self
            .gateway
            .create_checkout_session(user_id, tier, cycle)
            .await?;
        Ok(CheckoutResponse { checkout_url })
    }
}
