//! 内存版存储，供测试使用：与 SeaORM 实现一样保证唯一插入和带版本校验的覆盖

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{CandidateQuery, EventStore, NewWebhookEvent, RecordOutcome, SubscriptionStore};
use crate::entities::{
    PlanTier, ProcessingStatus, SubscriptionStatus, subscription_entity, webhook_event_entity,
};
use crate::error::{AppError, AppResult};

#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<Vec<subscription_entity::Model>>,
    writes: AtomicUsize,
    conflicts: AtomicUsize,
    reject_writes: AtomicBool,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 成功写入次数（插入与条件覆盖）
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// 打开后每次版本校验都失败，模拟别的实例一直抢先写入
    pub fn reject_writes(&self, on: bool) {
        self.reject_writes.store(on, Ordering::SeqCst);
    }

    /// 不做版本校验直接替换，用于准备测试数据
    pub fn put(&self, row: subscription_entity::Model) {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|r| r.id != row.id);
        rows.push(row);
    }

    fn select(
        &self,
        pred: impl Fn(&subscription_entity::Model) -> bool,
    ) -> Option<subscription_entity::Model> {
        self.rows.lock().unwrap().iter().find(|r| pred(r)).cloned()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<subscription_entity::Model>> {
        // 让并发测试里的任务有机会交错执行
        tokio::task::yield_now().await;
        Ok(self.select(|r| r.id == id))
    }

    async fn find_by_user(&self, user_id: i64) -> AppResult<Option<subscription_entity::Model>> {
        tokio::task::yield_now().await;
        Ok(self.select(|r| r.user_id == user_id))
    }

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<Option<subscription_entity::Model>> {
        Ok(self.select(|r| r.stripe_subscription_id.as_deref() == Some(stripe_subscription_id)))
    }

    async fn find_by_stripe_customer(
        &self,
        stripe_customer_id: &str,
    ) -> AppResult<Option<subscription_entity::Model>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|r| r.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn insert_free(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<subscription_entity::Model> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.iter().find(|r| r.user_id == user_id) {
            return Ok(existing.clone());
        }
        let row = subscription_entity::Model {
            id: rows.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            user_id,
            tier: PlanTier::Free,
            status: SubscriptionStatus::Inactive,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(row)
    }

    async fn compare_and_set(
        &self,
        expected_version: DateTime<Utc>,
        next: &subscription_entity::Model,
    ) -> AppResult<bool> {
        tokio::task::yield_now().await;
        if self.reject_writes.load(Ordering::SeqCst) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|r| r.id == next.id && r.updated_at == expected_version)
        {
            Some(slot) => {
                *slot = next.clone();
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    async fn reconciliation_candidates(
        &self,
        query: &CandidateQuery,
    ) -> AppResult<Vec<subscription_entity::Model>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.current_period_end);
        rows.truncate(query.limit as usize);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    rows: Mutex<Vec<webhook_event_entity::Model>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn status_of(&self, external_event_id: &str) -> Option<ProcessingStatus> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_event_id == external_event_id)
            .map(|r| r.processing_status)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record(
        &self,
        event: NewWebhookEvent,
        reclaim_pending_before: DateTime<Utc>,
    ) -> AppResult<RecordOutcome> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.external_event_id == event.external_event_id)
        {
            if !existing.is_reclaimable(reclaim_pending_before) {
                return Ok(RecordOutcome::Duplicate);
            }
            existing.processing_status = ProcessingStatus::Pending;
            existing.processed_at = Some(event.received_at);
            return Ok(RecordOutcome::Reclaimed);
        }

        let id = rows.len() as i64 + 1;
        rows.push(webhook_event_entity::Model {
            id,
            external_event_id: event.external_event_id,
            event_type: event.event_type,
            payload: event.payload,
            received_at: event.received_at,
            processed_at: None,
            processing_status: ProcessingStatus::Pending,
        });
        Ok(RecordOutcome::Inserted)
    }

    async fn mark(
        &self,
        external_event_id: &str,
        status: ProcessingStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.external_event_id == external_event_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Webhook event {external_event_id} not found"))
            })?;
        row.processing_status = status;
        row.processed_at = Some(at);
        Ok(())
    }

    async fn find(
        &self,
        external_event_id: &str,
    ) -> AppResult<Option<webhook_event_entity::Model>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_event_id == external_event_id)
            .cloned())
    }

    async fn failed_since(
        &self,
        since: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<webhook_event_entity::Model>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.processing_status == ProcessingStatus::Failed && r.last_attempt_at() >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.last_attempt_at());
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(id: &str, at: DateTime<Utc>) -> NewWebhookEvent {
        NewWebhookEvent {
            external_event_id: id.to_string(),
            event_type: "invoice.payment_failed".to_string(),
            payload: "{}".to_string(),
            received_at: at,
        }
    }

    #[tokio::test]
    async fn test_event_dedup_and_reclaim() {
        let store = MemoryEventStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let cutoff = t0 - Duration::minutes(15);

        assert_eq!(store.record(event("evt_1", t0), cutoff).await.unwrap(), RecordOutcome::Inserted);
        // 还在处理中（pending 未过期）
        assert_eq!(store.record(event("evt_1", t0), cutoff).await.unwrap(), RecordOutcome::Duplicate);

        store.mark("evt_1", ProcessingStatus::Failed, t0).await.unwrap();
        assert_eq!(store.record(event("evt_1", t0), cutoff).await.unwrap(), RecordOutcome::Reclaimed);
        assert_eq!(store.status_of("evt_1"), Some(ProcessingStatus::Pending));

        store.mark("evt_1", ProcessingStatus::Processed, t0).await.unwrap();
        assert_eq!(store.record(event("evt_1", t0), cutoff).await.unwrap(), RecordOutcome::Duplicate);

        // 被遗弃的 pending 可以被接管
        store.record(event("evt_2", t0), cutoff).await.unwrap();
        let later = t0 + Duration::hours(1);
        assert_eq!(
            store.record(event("evt_2", later), later - Duration::minutes(15)).await.unwrap(),
            RecordOutcome::Reclaimed
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_reclaim_keeps_received_at() {
        let store = MemoryEventStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        store.record(event("evt_1", t0), t0).await.unwrap();
        store.mark("evt_1", ProcessingStatus::Failed, t0 + Duration::minutes(1)).await.unwrap();

        let redelivered = t0 + Duration::hours(2);
        assert_eq!(
            store.record(event("evt_1", redelivered), redelivered - Duration::minutes(15)).await.unwrap(),
            RecordOutcome::Reclaimed
        );
        let row = store.find("evt_1").await.unwrap().unwrap();
        assert_eq!(row.received_at, t0);
        assert_eq!(row.processed_at, Some(redelivered));
        assert_eq!(row.processing_status, ProcessingStatus::Pending);

        // 刚被接管的 pending 以接管时间判断是否过期，而不是首次接收时间
        let soon = redelivered + Duration::minutes(5);
        assert_eq!(
            store.record(event("evt_1", soon), soon - Duration::minutes(15)).await.unwrap(),
            RecordOutcome::Duplicate
        );
        let abandoned = redelivered + Duration::minutes(20);
        assert_eq!(
            store.record(event("evt_1", abandoned), abandoned - Duration::minutes(15)).await.unwrap(),
            RecordOutcome::Reclaimed
        );
        assert_eq!(store.find("evt_1").await.unwrap().unwrap().received_at, t0);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_version() {
        let store = MemorySubscriptionStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let row = store.insert_free(9, t0).await.unwrap();
        assert_eq!(store.insert_free(9, t0 + Duration::seconds(1)).await.unwrap(), row);

        let mut next = row.clone();
        next.updated_at = t0 + Duration::seconds(1);
        assert!(store.compare_and_set(t0, &next).await.unwrap());
        assert!(!store.compare_and_set(t0, &next).await.unwrap());
        assert_eq!(store.writes(), 2);
        assert_eq!(store.conflicts(), 1);
    }
}
