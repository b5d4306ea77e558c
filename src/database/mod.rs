pub mod connection;
pub mod event_store;
pub mod subscription_store;

#[cfg(test)]
pub mod memory;

pub use connection::*;
pub use event_store::SeaOrmEventStore;
pub use subscription_store::SeaOrmSubscriptionStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::entities::{SubscriptionStatus, subscription_entity, webhook_event_entity};
use crate::error::AppResult;

/// 首次写入事件表的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// 首次见到该事件 id，已插入 pending 行
    Inserted,
    /// 之前处理失败（或被中断）的事件，已重新置为 pending
    Reclaimed,
    /// 已处理过或正在处理
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub external_event_id: String,
    pub event_type: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// 入站 webhook 事件表，按外部事件 id 去重
#[async_trait]
pub trait EventStore: Send + Sync {
    /// 新事件插入为 pending；已知事件若处理失败，或在 `reclaim_pending_before`
    /// 之前被接管后一直没有结果，则重新接管。接管是条件更新，并发时只有一个成功
    async fn record(
        &self,
        event: NewWebhookEvent,
        reclaim_pending_before: DateTime<Utc>,
    ) -> AppResult<RecordOutcome>;

    async fn mark(
        &self,
        external_event_id: &str,
        status: crate::entities::ProcessingStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn find(&self, external_event_id: &str)
    -> AppResult<Option<webhook_event_entity::Model>>;

    /// 最近一次尝试在 `since` 及之后失败的事件，按尝试时间升序
    async fn failed_since(
        &self,
        since: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<webhook_event_entity::Model>>;
}

/// 每个用户当前的订阅状态，以 `updated_at` 作为乐观锁版本号
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<subscription_entity::Model>>;

    async fn find_by_user(&self, user_id: i64) -> AppResult<Option<subscription_entity::Model>>;

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<Option<subscription_entity::Model>>;

    async fn find_by_stripe_customer(
        &self,
        stripe_customer_id: &str,
    ) -> AppResult<Option<subscription_entity::Model>>;

    /// 用户没有记录时插入免费 / inactive 行，返回库里最终的那一行
    async fn insert_free(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<subscription_entity::Model>;

    /// 仅当库中版本仍为 `expected_version` 时覆盖 `next.id` 对应的行，冲突返回 false
    async fn compare_and_set(
        &self,
        expected_version: DateTime<Utc>,
        next: &subscription_entity::Model,
    ) -> AppResult<bool>;

    async fn reconciliation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> AppResult<Vec<subscription_entity::Model>>;
}

#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery {
    pub now: DateTime<Utc>,
    pub stale_after: Duration,
    pub grace: Duration,
    pub limit: u64,
}

impl CandidateQuery {
    /// 对账候选条件的逐行判断，各存储实现共用
    pub fn matches(&self, row: &subscription_entity::Model) -> bool {
        let Some(period_end) = row.current_period_end else {
            return false;
        };
        let stale = row.status != SubscriptionStatus::Inactive
            && period_end < self.now - self.stale_after
            && row.updated_at < period_end;
        let grace_expired =
            row.status == SubscriptionStatus::PastDue && period_end + self.grace < self.now;
        let cancellation_elapsed =
            row.status == SubscriptionStatus::Canceled && period_end < self.now;
        stale || grace_expired || cancellation_elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PlanTier;
    use chrono::TimeZone;

    fn row(
        status: SubscriptionStatus,
        period_end: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> subscription_entity::Model {
        subscription_entity::Model {
            id: 1,
            user_id: 1,
            tier: PlanTier::Standard,
            status,
            stripe_subscription_id: Some("sub_1".into()),
            stripe_customer_id: Some("cus_1".into()),
            current_period_start: Some(period_end - Duration::days(30)),
            current_period_end: Some(period_end),
            cancel_at_period_end: false,
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_candidate_predicate() {
        let now = Utc.with_ymd_and_hms(2025, 9, 10, 12, 0, 0).unwrap();
        let query = CandidateQuery {
            now,
            stale_after: Duration::hours(1),
            grace: Duration::days(3),
            limit: 100,
        };
        let written_before_rollover = now - Duration::days(20);

        // 周期已滚动但我们没收到通知
        let stale = row(
            SubscriptionStatus::Active,
            now - Duration::hours(2),
            written_before_rollover,
        );
        assert!(query.matches(&stale));

        // 刚过期一会儿，webhook 可能还在路上
        let fresh = row(
            SubscriptionStatus::Active,
            now - Duration::minutes(10),
            written_before_rollover,
        );
        assert!(!query.matches(&fresh));

        // 过期后已对账写过一次
        let settled = row(SubscriptionStatus::Active, now - Duration::hours(2), now);
        assert!(!query.matches(&settled));

        let in_grace = row(SubscriptionStatus::PastDue, now - Duration::days(1), now);
        assert!(!query.matches(&in_grace));
        let grace_over = row(SubscriptionStatus::PastDue, now - Duration::days(4), now);
        assert!(query.matches(&grace_over));

        let canceled = row(SubscriptionStatus::Canceled, now - Duration::seconds(1), now);
        assert!(query.matches(&canceled));
        let canceled_future = row(SubscriptionStatus::Canceled, now + Duration::days(5), now);
        assert!(!query.matches(&canceled_future));

        let mut free = row(SubscriptionStatus::Inactive, now - Duration::days(9), now - Duration::days(40));
        free.current_period_end = None;
        assert!(!query.matches(&free));
    }
}
