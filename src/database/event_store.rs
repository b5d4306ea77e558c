use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::{NotSet, Set, Unchanged},
    ColumnTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};

use super::{DbPool, EventStore, NewWebhookEvent, RecordOutcome};
use crate::entities::ProcessingStatus;
use crate::entities::webhook_events::{ActiveModel, Column, Entity, Model};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct SeaOrmEventStore {
    pool: DbPool,
}

impl SeaOrmEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// 抢占一条失败或被遗弃的事件：以读到的状态与 processed_at 为条件更新，
    /// 并发的重投只有一个能成功。received_at 保持首次接收时间不变
    async fn reclaim(&self, existing: &Model, claimed_at: DateTime<Utc>) -> AppResult<bool> {
        let row = ActiveModel {
            id: Unchanged(existing.id),
            processing_status: Set(ProcessingStatus::Pending),
            processed_at: Set(Some(claimed_at)),
            ..Default::default()
        };

        let update = Entity::update(row)
            .filter(Column::ProcessingStatus.eq(existing.processing_status));
        let update = match existing.processed_at {
            Some(at) => update.filter(Column::ProcessedAt.eq(at)),
            None => update.filter(Column::ProcessedAt.is_null()),
        };
        match update.exec(&self.pool).await {
            Ok(_) => Ok(true),
            Err(DbErr::RecordNotUpdated) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventStore for SeaOrmEventStore {
    async fn record(
        &self,
        event: NewWebhookEvent,
        reclaim_pending_before: DateTime<Utc>,
    ) -> AppResult<RecordOutcome> {
        let row = ActiveModel {
            id: NotSet,
            external_event_id: Set(event.external_event_id.clone()),
            event_type: Set(event.event_type.clone()),
            payload: Set(event.payload.clone()),
            received_at: Set(event.received_at),
            processed_at: Set(None),
            processing_status: Set(ProcessingStatus::Pending),
        };

        // INSERT ... ON CONFLICT DO NOTHING：唯一约束就是去重
        let inserted = Entity::insert(row)
            .on_conflict(
                OnConflict::column(Column::ExternalEventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.pool)
            .await?;
        if inserted > 0 {
            return Ok(RecordOutcome::Inserted);
        }

        let existing = self
            .find(&event.external_event_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(format!(
                    "Webhook event {} conflicted but was not found",
                    event.external_event_id
                ))
            })?;

        if existing.is_reclaimable(reclaim_pending_before)
            && self.reclaim(&existing, event.received_at).await?
        {
            return Ok(RecordOutcome::Reclaimed);
        }
        Ok(RecordOutcome::Duplicate)
    }

    async fn mark(
        &self,
        external_event_id: &str,
        status: ProcessingStatus,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let existing = self.find(external_event_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("Webhook event {external_event_id} not found"))
        })?;

        let row = ActiveModel {
            id: Unchanged(existing.id),
            processing_status: Set(status),
            processed_at: Set(Some(at)),
            ..Default::default()
        };
        Entity::update(row).exec(&self.pool).await?;
        Ok(())
    }

    async fn find(&self, external_event_id: &str) -> AppResult<Option<Model>> {
        Ok(Entity::find()
            .filter(Column::ExternalEventId.eq(external_event_id))
            .one(&self.pool)
            .await?)
    }

    async fn failed_since(&self, since: DateTime<Utc>, limit: u64) -> AppResult<Vec<Model>> {
        Ok(Entity::find()
            .filter(Column::ProcessingStatus.eq(ProcessingStatus::Failed))
            .filter(Column::ProcessedAt.gte(since))
            .order_by_asc(Column::ProcessedAt)
            .limit(limit)
            .all(&self.pool)
            .await?)
    }
}
