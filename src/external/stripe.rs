use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;

use ::stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, StripeError,
    Subscription, SubscriptionId, Webhook, WebhookError,
};

use crate::config::StripeConfig;
use crate::entities::PlanTier;
use crate::error::{AppError, AppResult};
use crate::external::gateway::{BillingCycle, PaymentGateway};
use crate::external::provider::{META_TIER, META_USER_ID, ProviderSubscriptionSnapshot};

/// Stripe 网关实现
///
/// 未配置密钥时不会 panic，而是禁用所有 Stripe 调用（系统退化为仅免费套餐）。
#[derive(Clone)]
pub struct StripeGateway {
    client: Option<Client>,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = if config.has_credentials() {
            Some(Client::new(config.secret_key.clone()))
        } else {
            log::warn!(
                "STRIPE_SECRET_KEY is not configured: payment provider calls are disabled, only the free tier is available"
            );
            None
        };
        if config.webhook_secret.trim().is_empty() {
            log::warn!(
                "STRIPE_WEBHOOK_SECRET is not configured: every webhook delivery will be rejected"
            );
        }
        Self { client, config }
    }

    fn client(&self) -> AppResult<&Client> {
        self.client.as_ref().ok_or(AppError::GatewayDisabled)
    }

    /// 所有 Stripe 调用都带超时，且不在内部重试
    async fn bounded<T, F>(&self, operation: &str, call: F) -> AppResult<T>
    where
        F: Future<Output = Result<T, StripeError>>,
    {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::GatewayTimeout(format!(
                "{operation} exceeded {}s",
                timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    async fn create_checkout_session(
        &self,
        user_id: i64,
        tier: PlanTier,
        cycle: BillingCycle,
    ) -> AppResult<String> {
        let client = self.client()?;
        let price_id = self.config.price_id(tier, cycle).ok_or_else(|| {
            AppError::ConfigError(format!("No Stripe price configured for {tier} ({cycle})"))
        })?;

        let user_ref = user_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), user_ref.clone());
        metadata.insert(META_TIER.to_string(), tier.to_string());
        metadata.insert("billing_cycle".to_string(), cycle.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&self.config.success_url);
        params.cancel_url = Some(&self.config.cancel_url);
        params.client_reference_id = Some(&user_ref);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        // 订阅对象本身也带上 user_id / tier，webhook 据此定位用户
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            trial_period_days: self.config.trial_period_days,
            ..Default::default()
        });

        let session = self
            .bounded("create_checkout_session", CheckoutSession::create(client, params))
            .await?;

        log::info!(
            "Created checkout session {} for user_id={user_id}, tier={tier}, cycle={cycle}",
            session.id
        );

        session
            .url
            .ok_or_else(|| AppError::GatewayError("Checkout session URL missing".to_string()))
    }

    async fn fetch_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<ProviderSubscriptionSnapshot> {
        let client = self.client()?;
        let id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| {
                AppError::ValidationError(format!(
                    "Invalid subscription id {stripe_subscription_id}: {e}"
                ))
            })?;

        let subscription = self
            .bounded(
                "fetch_subscription",
                Subscription::retrieve(client, &id, &[]),
            )
            .await?;

        // 复用 webhook 的解析逻辑，保证两条路径看到的是同一份快照
        let object = serde_json::to_value(&subscription)?;
        let mut snapshot = ProviderSubscriptionSnapshot::from_object(&object)?;
        snapshot.resolve_tier(&self.config);
        Ok(snapshot)
    }

    fn verify_signature(&self, raw_body: &[u8], signature_header: &str) -> bool {
        if self.config.webhook_secret.trim().is_empty() || signature_header.is_empty() {
            return false;
        }
        let Ok(payload) = std::str::from_utf8(raw_body) else {
            log::warn!("Webhook payload is not valid UTF-8");
            return false;
        };

        match Webhook::construct_event(payload, signature_header, &self.config.webhook_secret) {
            Ok(_) => true,
            // 签名已通过，只是 async-stripe 的事件类型无法解析该载荷；载荷由我们自己解析
            Err(WebhookError::BadParse(_)) => true,
            Err(e) => {
                log::warn!("Stripe webhook signature verification failed: {e}");
                false
            }
        }
    }
}
