use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::{NotSet, Set, Unchanged},
    ColumnTrait, Condition, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};

use super::{CandidateQuery, DbPool, SubscriptionStore};
use crate::entities::subscriptions::{ActiveModel, Column, Entity, Model};
use crate::entities::{PlanTier, SubscriptionStatus};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct SeaOrmSubscriptionStore {
    pool: DbPool,
}

impl SeaOrmSubscriptionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmSubscriptionStore {
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Model>> {
        Ok(Entity::find_by_id(id).one(&self.pool).await?)
    }

    async fn find_by_user(&self, user_id: i64) -> AppResult<Option<Model>> {
        Ok(Entity::find()
            .filter(Column::UserId.eq(user_id))
            .one(&self.pool)
            .await?)
    }

    async fn find_by_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<Option<Model>> {
        Ok(Entity::find()
            .filter(Column::StripeSubscriptionId.eq(stripe_subscription_id))
            .one(&self.pool)
            .await?)
    }

    async fn find_by_stripe_customer(&self, stripe_customer_id: &str) -> AppResult<Option<Model>> {
        // 同一客户可能先后有过多条订阅，取最近写入的
        Ok(Entity::find()
            .filter(Column::StripeCustomerId.eq(stripe_customer_id))
            .order_by_desc(Column::UpdatedAt)
            .one(&self.pool)
            .await?)
    }

    async fn insert_free(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<Model> {
        let row = ActiveModel {
            id: NotSet,
            user_id: Set(user_id),
            tier: Set(PlanTier::Free),
            status: Set(SubscriptionStatus::Inactive),
            stripe_subscription_id: Set(None),
            stripe_customer_id: Set(None),
            current_period_start: Set(None),
            current_period_end: Set(None),
            cancel_at_period_end: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Entity::insert(row)
            .on_conflict(OnConflict::column(Column::UserId).do_nothing().to_owned())
            .exec_without_returning(&self.pool)
            .await?;

        self.find_by_user(user_id).await?.ok_or_else(|| {
            AppError::InternalError(format!("Subscription row for user {user_id} vanished"))
        })
    }

    async fn compare_and_set(&self, expected_version: DateTime<Utc>, next: &Model) -> AppResult<bool> {
        let row = ActiveModel {
            id: Unchanged(next.id),
            user_id: Unchanged(next.user_id),
            tier: Set(next.tier),
            status: Set(next.status),
            stripe_subscription_id: Set(next.stripe_subscription_id.clone()),
            stripe_customer_id: Set(next.stripe_customer_id.clone()),
            current_period_start: Set(next.current_period_start),
            current_period_end: Set(next.current_period_end),
            cancel_at_period_end: Set(next.cancel_at_period_end),
            created_at: Unchanged(next.created_at),
            updated_at: Set(next.updated_at),
        };

        match Entity::update(row)
            .filter(Column::UpdatedAt.eq(expected_version))
            .exec(&self.pool)
            .await
        {
            Ok(_) => Ok(true),
            // 版本号不匹配（或行不存在）时 UPDATE 影响 0 行
            Err(DbErr::RecordNotUpdated) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn reconciliation_candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Model>> {
        let stale = Condition::all()
            .add(Column::Status.ne(SubscriptionStatus::Inactive))
            .add(Column::CurrentPeriodEnd.lt(query.now - query.stale_after))
            .add(Expr::col(Column::UpdatedAt).lt(Expr::col(Column::CurrentPeriodEnd)));
        let grace_expired = Condition::all()
            .add(Column::Status.eq(SubscriptionStatus::PastDue))
            .add(Column::CurrentPeriodEnd.lt(query.now - query.grace));
        let cancellation_elapsed = Condition::all()
            .add(Column::Status.eq(SubscriptionStatus::Canceled))
            .add(Column::CurrentPeriodEnd.lt(query.now));

        let rows = Entity::find()
            .filter(
                Condition::any()
                    .add(stale)
                    .add(grace_expired)
                    .add(cancellation_elapsed),
            )
            .order_by_asc(Column::CurrentPeriodEnd)
            .limit(query.limit)
            .all(&self.pool)
            .await?;
        Ok(rows)
    }
}
