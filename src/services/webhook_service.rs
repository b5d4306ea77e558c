use std::sync::Arc;

use chrono::Duration;

use crate::config::StripeConfig;
use crate::database::{EventStore, NewWebhookEvent, RecordOutcome};
use crate::entities::ProcessingStatus;
use crate::error::{AppError, AppResult};
use crate::external::{EventKind, PaymentGateway, ProviderEvent};
use crate::models::WebhookOutcome;
use crate::services::subscription_machine::{BillingEvent, SubscriptionState, transition};
use crate::services::subscription_service::SubscriptionService;

/// Stripe webhook 处理流水线：验签 → 去重落库 → 状态机 → 标记结果
#[derive(Clone)]
pub struct WebhookService {
    events: Arc<dyn EventStore>,
    subscriptions: SubscriptionService,
    gateway: Arc<dyn PaymentGateway>,
    stripe: StripeConfig,
    pending_reclaim_after: Duration,
}

impl WebhookService {
    pub fn new(
        events: Arc<dyn EventStore>,
        subscriptions: SubscriptionService,
        gateway: Arc<dyn PaymentGateway>,
        stripe: StripeConfig,
        pending_reclaim_after: Duration,
    ) -> Self {
        Self {
            events,
            subscriptions,
            gateway,
            stripe,
            pending_reclaim_after,
        }
    }

    pub async fn handle(&self, raw_body: &[u8], signature_header: &str) -> AppResult<WebhookOutcome> {
        // 验签失败直接拒绝，不落库
        if !self.gateway.verify_signature(raw_body, signature_header) {
            return Err(AppError::AuthError("Invalid webhook signature".to_string()));
        }

        let payload = std::str::from_utf8(raw_body)
            .map_err(|_| AppError::ValidationError("Invalid payload encoding".to_string()))?;
        let event = ProviderEvent::parse(payload)?;

        let now = self.subscriptions.now();
        let recorded = self
            .events
            .record(
                NewWebhookEvent {
                    external_event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    payload: payload.to_string(),
                    received_at: now,
                },
                now - self.pending_reclaim_after,
            )
            .await?;

        match recorded {
            RecordOutcome::Duplicate => {
                log::info!("Duplicate webhook event {} ({}) skipped", event.id, event.event_type);
                return Ok(WebhookOutcome::Duplicate);
            }
            RecordOutcome::Reclaimed => {
                log::info!("Retrying webhook event {} ({})", event.id, event.event_type);
            }
            RecordOutcome::Inserted => {
                log::info!("Received webhook event {} ({})", event.id, event.event_type);
            }
        }

        if event.kind() == EventKind::Irrelevant {
            self.finish(&event.id, ProcessingStatus::Ignored).await?;
            return Ok(WebhookOutcome::Ignored);
        }

        match self.dispatch(&event).await {
            Ok(()) => {
                self.finish(&event.id, ProcessingStatus::Processed).await?;
                Ok(WebhookOutcome::Processed)
            }
            Err(e) if e.is_permanent() => {
                // 重投也无济于事：记为失败并返回 200，交给对账任务
                log::error!(
                    "Webhook event {} ({}) rejected: {e}",
                    event.id,
                    event.event_type
                );
                self.finish(&event.id, ProcessingStatus::Failed).await?;
                Ok(WebhookOutcome::Failed)
            }
            Err(e) => {
                log::error!(
                    "Webhook event {} ({}) failed, awaiting redelivery: {e}",
                    event.id,
                    event.event_type
                );
                if let Err(mark_err) = self.finish(&event.id, ProcessingStatus::Failed).await {
                    log::error!("Failed to mark webhook event {} as failed: {mark_err}", event.id);
                }
                Err(e)
            }
        }
    }

    async fn finish(&self, event_id: &str, status: ProcessingStatus) -> AppResult<()> {
        self.events
            .mark(event_id, status, self.subscriptions.now())
            .await
    }

    async fn dispatch(&self, event: &ProviderEvent) -> AppResult<()> {
        let Some(billing_event) = BillingEvent::from_provider(event, &self.stripe)? else {
            return Ok(());
        };

        let keys = event.subscription_ref();
        let row = match self.subscriptions.locate(&keys).await? {
            Some(row) => row,
            // 尚未建档的用户首次订阅时补建免费记录
            None => match (&billing_event, keys.user_id) {
                (BillingEvent::SubscriptionCreated(_), Some(user_id)) => {
                    self.subscriptions.provision(user_id).await?
                }
                _ => {
                    return Err(AppError::NotFound(format!(
                        "No subscription matches event {} ({:?})",
                        event.id, keys
                    )));
                }
            },
        };

        let outcome = self
            .subscriptions
            .apply(row.id, &event.id, |row, now| {
                Ok(transition(
                    &SubscriptionState::from(row),
                    &billing_event,
                    now,
                )?)
            })
            .await?;

        log::debug!(
            "Webhook event {} applied to subscription {}: {:?}",
            event.id,
            row.id,
            outcome.subscription().status
        );
        Ok(())
    }
}
