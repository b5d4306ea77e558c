use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use crate::config::BillingConfig;
use crate::database::{CandidateQuery, EventStore};
use crate::entities::subscription_entity::Model as Subscription;
use crate::error::AppResult;
use crate::external::{PaymentGateway, subscription_ref_in_payload};
use crate::services::subscription_machine::{SubscriptionState, finalize_locally, reconcile};
use crate::services::subscription_service::{ApplyOutcome, SubscriptionService};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// 对账任务：以 Stripe 为准修正本地记录，弥补丢失或乱序的 webhook
#[derive(Clone)]
pub struct ReconciliationService {
    subscriptions: SubscriptionService,
    events: Arc<dyn EventStore>,
    gateway: Arc<dyn PaymentGateway>,
    billing: BillingConfig,
}

struct Candidate {
    row: Subscription,
    /// 本地没有订阅 id 时，从失败事件载荷里找回的 id
    hinted_subscription_id: Option<String>,
}

impl ReconciliationService {
    pub fn new(
        subscriptions: SubscriptionService,
        events: Arc<dyn EventStore>,
        gateway: Arc<dyn PaymentGateway>,
        billing: BillingConfig,
    ) -> Self {
        Self {
            subscriptions,
            events,
            gateway,
            billing,
        }
    }

    pub async fn run_once(&self) -> AppResult<ReconciliationReport> {
        if !self.gateway.is_enabled() {
            log::warn!("Reconciliation skipped: payment gateway is disabled");
            return Ok(ReconciliationReport::default());
        }

        let candidates = self.collect_candidates().await?;
        let mut report = ReconciliationReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            match self.reconcile_one(&candidate).await {
                Ok(ApplyOutcome::Updated(_)) => report.updated += 1,
                Ok(ApplyOutcome::Unchanged(_)) => report.unchanged += 1,
                Err(e) => {
                    // 网关或存储故障留到下一轮
                    log::warn!(
                        "Reconciliation of subscription {} (user_id={}) failed: {e}",
                        candidate.row.id,
                        candidate.row.user_id
                    );
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            log::info!(
                "Reconciliation finished: examined={}, updated={}, unchanged={}, failed={}",
                report.examined,
                report.updated,
                report.unchanged,
                report.failed
            );
        }
        Ok(report)
    }

    async fn collect_candidates(&self) -> AppResult<Vec<Candidate>> {
        let now = self.subscriptions.now();
        let query = CandidateQuery {
            now,
            stale_after: self.billing.stale_after(),
            grace: self.billing.grace_period(),
            limit: self.billing.reconcile_batch_size,
        };

        let mut found: HashMap<i64, Candidate> = HashMap::new();
        for row in self
            .subscriptions
            .store()
            .reconciliation_candidates(&query)
            .await?
        {
            found.insert(
                row.id,
                Candidate {
                    row,
                    hinted_subscription_id: None,
                },
            );
        }

        // 事件失败之后记录没再被写过，说明那次变更可能丢了
        let failed = self
            .events
            .failed_since(now - self.billing.failed_event_lookback(), query.limit)
            .await?;
        for event in failed {
            let Some(keys) = subscription_ref_in_payload(&event.payload) else {
                continue;
            };
            let Some(row) = self.subscriptions.locate(&keys).await? else {
                log::debug!(
                    "Failed event {} matches no subscription, skipping",
                    event.external_event_id
                );
                continue;
            };
            if event.last_attempt_at() <= row.updated_at {
                continue;
            }
            let entry = found.entry(row.id).or_insert(Candidate {
                row,
                hinted_subscription_id: None,
            });
            if entry.hinted_subscription_id.is_none() {
                entry.hinted_subscription_id = keys.subscription_id;
            }
        }

        let mut candidates: Vec<Candidate> = found.into_values().collect();
        candidates.sort_by_key(|c| c.row.id);
        Ok(candidates)
    }

    async fn reconcile_one(&self, candidate: &Candidate) -> AppResult<ApplyOutcome> {
        let grace = self.billing.grace_period();
        let provider_id = candidate
            .row
            .stripe_subscription_id
            .clone()
            .or_else(|| candidate.hinted_subscription_id.clone());

        let Some(provider_id) = provider_id else {
            return self
                .subscriptions
                .apply(candidate.row.id, "reconciliation", |row, now| {
                    Ok(finalize_locally(&SubscriptionState::from(row), now, grace))
                })
                .await;
        };

        // 先取快照，拿到后才加锁
        let snapshot = self.gateway.fetch_subscription(&provider_id).await?;
        self.subscriptions
            .apply(candidate.row.id, "reconciliation", |row, now| {
                Ok(reconcile(&SubscriptionState::from(row), &snapshot, now, grace)?)
            })
            .await
    }
}
