use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::database::SubscriptionStore;
use crate::entities::subscription_entity::Model as Subscription;
use crate::error::{AppError, AppResult};
use crate::external::SubscriptionRef;
use crate::services::subscription_machine::{SubscriptionState, Transition};
use crate::utils::{Clock, KeyedLocks, next_version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Updated(Subscription),
    Unchanged(Subscription),
}

impl ApplyOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            ApplyOutcome::Updated(s) | ApplyOutcome::Unchanged(s) => s,
        }
    }
}

/// 订阅记录的唯一写入口：按订阅加锁，读-判定-条件写
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    max_write_attempts: u32,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        max_write_attempts: u32,
    ) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            clock,
            max_write_attempts: max_write_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 新用户建档：免费 / inactive，重复调用无副作用
    pub async fn provision(&self, user_id: i64) -> AppResult<Subscription> {
        let row = self.store.insert_free(user_id, self.clock.now()).await?;
        log::debug!("Provisioned subscription {} for user_id={user_id}", row.id);
        Ok(row)
    }

    pub async fn find_by_user(&self, user_id: i64) -> AppResult<Option<Subscription>> {
        self.store.find_by_user(user_id).await
    }

    /// 依次按 Stripe 订阅 id、metadata 中的 user_id、Stripe 客户 id 查找
    pub async fn locate(&self, keys: &SubscriptionRef) -> AppResult<Option<Subscription>> {
        if let Some(id) = keys.subscription_id.as_deref()
            && let Some(row) = self.store.find_by_stripe_subscription(id).await?
        {
            return Ok(Some(row));
        }
        if let Some(user_id) = keys.user_id
            && let Some(row) = self.store.find_by_user(user_id).await?
        {
            return Ok(Some(row));
        }
        if let Some(customer) = keys.customer_id.as_deref() {
            return self.store.find_by_stripe_customer(customer).await;
        }
        Ok(None)
    }

    /// 读最新行，用 `decide` 计算转移，再带版本校验写回。
    /// 其他实例抢先写入时会重读重算，`decide` 可能被调用多次
    pub async fn apply<F>(&self, id: i64, context: &str, decide: F) -> AppResult<ApplyOutcome>
    where
        F: Fn(&Subscription, DateTime<Utc>) -> AppResult<Transition> + Send + Sync,
    {
        let _guard = self.locks.lock(id).await;

        for attempt in 1..=self.max_write_attempts {
            let row = self
                .store
                .find_by_id(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Subscription {id} not found")))?;
            let now = self.clock.now();
            let transition = decide(&row, now)?;
            let current = SubscriptionState::from(&row);
            if transition.is_noop(&current) {
                return Ok(ApplyOutcome::Unchanged(row));
            }

            let mut next = row.clone();
            transition.next.write_to(&mut next);
            next.updated_at = next_version(row.updated_at, now);

            if self.store.compare_and_set(row.updated_at, &next).await? {
                let effects = transition
                    .effects
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                log::info!(
                    "[{context}] subscription {id} (user_id={}): {}/{} -> {}/{} [{effects}]",
                    row.user_id,
                    row.tier,
                    row.status,
                    next.tier,
                    next.status
                );
                return Ok(ApplyOutcome::Updated(next));
            }

            log::warn!(
                "[{context}] version conflict on subscription {id} (attempt {attempt}/{})",
                self.max_write_attempts
            );
        }

        Err(AppError::WriteConflict(format!(
            "[{context}] subscription {id} still conflicting after {} attempts",
            self.max_write_attempts
        )))
    }
}
